//! Target model - backend targets and the coordinates they attach under.
//!
//! Everything here is validated at construction: a [`Target`] always carries
//! exactly one endpoint and an in-range weight, an [`AttachmentScope`] always
//! has a load balancer and a listener, and a [`TargetSet`] never holds two
//! targets with the same [`TargetKey`].

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Weight assigned to targets that do not specify one.
pub const DEFAULT_WEIGHT: u8 = 10;

/// Highest weight the provider accepts.
pub const MAX_WEIGHT: u8 = 100;

/// Separator used in the durable attachment resource id.
const RESOURCE_ID_SEPARATOR: char = '#';

/// Validation errors for targets, scopes and target sets.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("target must set exactly one of instance_id or eni_ip, got both")]
    AmbiguousEndpoint,

    #[error("target must set one of instance_id or eni_ip")]
    MissingEndpoint,

    #[error("Invalid interface IP address: {0}")]
    InvalidInterfaceIp(String),

    #[error("port {0} is out of range 0-65535")]
    PortOutOfRange(u32),

    #[error("weight {0} is out of range 0-100")]
    WeightOutOfRange(u32),

    #[error("duplicate target {0}")]
    DuplicateTarget(TargetKey),

    #[error("{0} is required")]
    MissingScopeField(&'static str),

    #[error("Invalid attachment id: {0}")]
    InvalidResourceId(String),
}

/// The addressable half of a target: a compute instance or an interface IP.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Endpoint {
    Instance(String),
    Interface(IpAddr),
}

impl Endpoint {
    /// Build an endpoint from the two mutually exclusive optional fields.
    ///
    /// Empty strings count as unset.
    pub fn from_parts(instance_id: Option<&str>, eni_ip: Option<&str>) -> Result<Self, ModelError> {
        let instance_id = instance_id.filter(|s| !s.is_empty());
        let eni_ip = eni_ip.filter(|s| !s.is_empty());

        match (instance_id, eni_ip) {
            (Some(_), Some(_)) => Err(ModelError::AmbiguousEndpoint),
            (None, None) => Err(ModelError::MissingEndpoint),
            (Some(id), None) => Ok(Endpoint::Instance(id.to_string())),
            (None, Some(ip)) => ip
                .parse()
                .map(Endpoint::Interface)
                .map_err(|_| ModelError::InvalidInterfaceIp(ip.to_string())),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Instance(id) => write!(f, "{}", id),
            Endpoint::Interface(ip) => write!(f, "{}", ip),
        }
    }
}

/// Diffing identity of a target. Weight is not part of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetKey {
    pub endpoint: Endpoint,
    pub port: u16,
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.endpoint {
            Endpoint::Interface(IpAddr::V6(ip)) => write!(f, "[{}]:{}", ip, self.port),
            endpoint => write!(f, "{}:{}", endpoint, self.port),
        }
    }
}

/// One backend endpoint registered (or to be registered) on a listener.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    endpoint: Endpoint,
    port: u16,
    weight: u8,
}

impl Target {
    pub fn new(endpoint: Endpoint, port: u16, weight: u8) -> Result<Self, ModelError> {
        if weight > MAX_WEIGHT {
            return Err(ModelError::WeightOutOfRange(weight.into()));
        }
        if let Endpoint::Instance(id) = &endpoint {
            if id.is_empty() {
                return Err(ModelError::MissingEndpoint);
            }
        }
        Ok(Self {
            endpoint,
            port,
            weight,
        })
    }

    /// A compute instance target with the default weight.
    pub fn instance(instance_id: impl Into<String>, port: u16) -> Result<Self, ModelError> {
        Self::new(Endpoint::Instance(instance_id.into()), port, DEFAULT_WEIGHT)
    }

    /// An elastic network interface target with the default weight.
    pub fn interface(ip: IpAddr, port: u16) -> Result<Self, ModelError> {
        Self::new(Endpoint::Interface(ip), port, DEFAULT_WEIGHT)
    }

    pub fn with_weight(self, weight: u8) -> Result<Self, ModelError> {
        Self::new(self.endpoint, self.port, weight)
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn weight(&self) -> u8 {
        self.weight
    }

    pub fn key(&self) -> TargetKey {
        TargetKey {
            endpoint: self.endpoint.clone(),
            port: self.port,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (weight {})", self.key(), self.weight)
    }
}

fn default_weight() -> u32 {
    DEFAULT_WEIGHT.into()
}

/// Loosely typed target as it appears in attachment documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eni_ip: Option<String>,
    pub port: u32,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

impl TryFrom<TargetSpec> for Target {
    type Error = ModelError;

    fn try_from(spec: TargetSpec) -> Result<Self, Self::Error> {
        let endpoint = Endpoint::from_parts(spec.instance_id.as_deref(), spec.eni_ip.as_deref())?;
        let port = u16::try_from(spec.port).map_err(|_| ModelError::PortOutOfRange(spec.port))?;
        let weight = u8::try_from(spec.weight)
            .ok()
            .filter(|w| *w <= MAX_WEIGHT)
            .ok_or(ModelError::WeightOutOfRange(spec.weight))?;
        Target::new(endpoint, port, weight)
    }
}

impl From<&Target> for TargetSpec {
    fn from(target: &Target) -> Self {
        let (instance_id, eni_ip) = match &target.endpoint {
            Endpoint::Instance(id) => (Some(id.clone()), None),
            Endpoint::Interface(ip) => (None, Some(ip.to_string())),
        };
        Self {
            instance_id,
            eni_ip,
            port: target.port.into(),
            weight: target.weight.into(),
        }
    }
}

/// Coordinates under which targets are registered.
///
/// Immutable once an attachment exists: a different scope means the old
/// attachment is drained and a new one is created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttachmentScope {
    load_balancer_id: String,
    listener_id: String,
    rule_id: Option<String>,
}

impl AttachmentScope {
    pub fn new(
        load_balancer_id: impl Into<String>,
        listener_id: impl Into<String>,
        rule_id: Option<String>,
    ) -> Result<Self, ModelError> {
        let load_balancer_id = load_balancer_id.into();
        let listener_id = listener_id.into();
        if load_balancer_id.is_empty() {
            return Err(ModelError::MissingScopeField("load balancer id"));
        }
        if listener_id.is_empty() {
            return Err(ModelError::MissingScopeField("listener id"));
        }
        Ok(Self {
            load_balancer_id,
            listener_id,
            rule_id: rule_id.filter(|r| !r.is_empty()),
        })
    }

    pub fn load_balancer_id(&self) -> &str {
        &self.load_balancer_id
    }

    pub fn listener_id(&self) -> &str {
        &self.listener_id
    }

    /// Forwarding rule id; `None` for layer-4 listeners.
    pub fn rule_id(&self) -> Option<&str> {
        self.rule_id.as_deref()
    }

    /// Whether moving from `self` to `other` needs a destructive replace.
    pub fn requires_replace(&self, other: &AttachmentScope) -> bool {
        self != other
    }

    /// Durable resource id: `rule#listener#load_balancer` (rule may be empty).
    pub fn resource_id(&self) -> String {
        format!(
            "{}{sep}{}{sep}{}",
            self.rule_id.as_deref().unwrap_or_default(),
            self.listener_id,
            self.load_balancer_id,
            sep = RESOURCE_ID_SEPARATOR
        )
    }

    /// Inverse of [`AttachmentScope::resource_id`].
    pub fn parse_resource_id(id: &str) -> Result<Self, ModelError> {
        let parts: Vec<&str> = id.split(RESOURCE_ID_SEPARATOR).collect();
        match parts.as_slice() {
            [rule, listener, lb] => Self::new(*lb, *listener, Some(rule.to_string()))
                .map_err(|_| ModelError::InvalidResourceId(id.to_string())),
            _ => Err(ModelError::InvalidResourceId(id.to_string())),
        }
    }
}

impl fmt::Display for AttachmentScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.load_balancer_id, self.listener_id)?;
        if let Some(rule) = &self.rule_id {
            write!(f, "/{}", rule)?;
        }
        Ok(())
    }
}

/// A set of targets keyed by [`TargetKey`], in key order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetSet {
    targets: BTreeMap<TargetKey, Target>,
}

impl TargetSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set, rejecting duplicate keys instead of silently merging them.
    pub fn from_targets<I>(targets: I) -> Result<Self, ModelError>
    where
        I: IntoIterator<Item = Target>,
    {
        let mut set = Self::new();
        for target in targets {
            let key = target.key();
            if set.targets.contains_key(&key) {
                return Err(ModelError::DuplicateTarget(key));
            }
            set.targets.insert(key, target);
        }
        Ok(set)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn contains(&self, key: &TargetKey) -> bool {
        self.targets.contains_key(key)
    }

    pub fn get(&self, key: &TargetKey) -> Option<&Target> {
        self.targets.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Target> {
        self.targets.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = &TargetKey> {
        self.targets.keys()
    }

    pub fn to_vec(&self) -> Vec<Target> {
        self.targets.values().cloned().collect()
    }

    /// Insert or replace the target with the same key.
    pub(crate) fn upsert(&mut self, target: Target) -> Option<Target> {
        self.targets.insert(target.key(), target)
    }

    pub(crate) fn remove(&mut self, key: &TargetKey) -> Option<Target> {
        self.targets.remove(key)
    }
}

/// Desired state of one attachment resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentSpec {
    pub scope: AttachmentScope,
    pub targets: TargetSet,
}

impl AttachmentSpec {
    pub fn new(scope: AttachmentScope, targets: TargetSet) -> Self {
        Self { scope, targets }
    }
}

/// Attachment as written in JSON documents (CLI input, fixtures).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentDocument {
    pub clb_id: String,
    pub listener_id: String,
    #[serde(default)]
    pub rule_id: String,
    #[serde(default)]
    pub targets: Vec<TargetSpec>,
}

impl TryFrom<AttachmentDocument> for AttachmentSpec {
    type Error = ModelError;

    fn try_from(doc: AttachmentDocument) -> Result<Self, Self::Error> {
        let scope = AttachmentScope::new(doc.clb_id, doc.listener_id, Some(doc.rule_id))?;
        let targets = doc
            .targets
            .into_iter()
            .map(Target::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            scope,
            targets: TargetSet::from_targets(targets)?,
        })
    }
}

impl From<&AttachmentSpec> for AttachmentDocument {
    fn from(spec: &AttachmentSpec) -> Self {
        Self {
            clb_id: spec.scope.load_balancer_id.clone(),
            listener_id: spec.scope.listener_id.clone(),
            rule_id: spec.scope.rule_id.clone().unwrap_or_default(),
            targets: spec.targets.iter().map(TargetSpec::from).collect(),
        }
    }
}
