//! Simulated cloud account

use crate::adapter::MemoryAdapter;
use crate::fault::{CallKind, FaultRule};
use serde::Serialize;
use serde_json::{Value, json};
use stackflow_engine::{
    Attributes, CreatedResource, ProviderError, ProviderRegistry, ResolvedProps, ResourceType,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

pub const REGION: &str = "us-east-1";
pub const ACCOUNT_ID: &str = "123456789012";

/// Properties each resource type must be created with
fn required_props(resource_type: ResourceType) -> &'static [&'static str] {
    match resource_type {
        ResourceType::Network => &[],
        ResourceType::Subnet => &["vpcId"],
        ResourceType::SecurityGroup => &["vpcId"],
        ResourceType::Instance => &["subnetId"],
        ResourceType::LoadBalancer => &["subnets"],
        ResourceType::TargetGroup => &["vpcId"],
        ResourceType::Listener => &["loadBalancerArn", "targetGroupArn"],
    }
}

/// A provider call as seen by the simulated account
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Call {
    pub kind: CallKind,
    pub resource_type: ResourceType,
    /// `name` property for creates, remote id for everything else
    pub target: String,
}

#[derive(Debug, Clone)]
struct RemoteObject {
    resource_type: ResourceType,
    props: ResolvedProps,
    attributes: Attributes,
}

#[derive(Debug, Default)]
struct Inner {
    objects: BTreeMap<String, RemoteObject>,
    sequence: HashMap<ResourceType, u32>,
    calls: Vec<Call>,
    faults: Vec<FaultRule>,
    latency: Duration,
    in_flight: usize,
    peak_in_flight: usize,
}

/// In-memory stand-in for a cloud account.
///
/// Clones share the same account, so a test can keep a handle while the
/// engine drives the adapters.
#[derive(Debug, Clone)]
pub struct MemoryCloud {
    inner: Arc<Mutex<Inner>>,
    /// Number of calls that reached the account
    call_count: Arc<watch::Sender<usize>>,
}

impl Default for MemoryCloud {
    fn default() -> Self {
        let (call_count, _) = watch::channel(0);
        Self {
            inner: Arc::default(),
            call_count: Arc::new(call_count),
        }
    }
}

/// Counts a call as in flight until dropped
pub(crate) struct InFlight {
    inner: Arc<Mutex<Inner>>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.in_flight = inner.in_flight.saturating_sub(1);
    }
}

impl MemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency`
    pub fn with_latency(self, latency: Duration) -> Self {
        self.lock().latency = latency;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registry with one adapter per resource type, all backed by this account
    pub fn registry(&self) -> ProviderRegistry {
        ResourceType::ALL
            .into_iter()
            .fold(ProviderRegistry::new(), |registry, resource_type| {
                registry.with(
                    resource_type,
                    Arc::new(MemoryAdapter::new(self.clone(), resource_type)),
                )
            })
    }

    pub fn inject(&self, rule: FaultRule) {
        self.lock().faults.push(rule);
    }

    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn count(&self, kind: CallKind) -> usize {
        self.lock().calls.iter().filter(|c| c.kind == kind).count()
    }

    /// Calls of `kind` made against `target`
    pub fn count_for(&self, kind: CallKind, target: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.kind == kind && c.target == target)
            .count()
    }

    /// Highest number of calls that were in flight at the same time
    pub fn peak_concurrency(&self) -> usize {
        self.lock().peak_in_flight
    }

    pub fn object_count(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn contains(&self, remote_id: &str) -> bool {
        self.lock().objects.contains_key(remote_id)
    }

    pub fn attributes(&self, remote_id: &str) -> Option<Attributes> {
        let inner = self.lock();
        inner.objects.get(remote_id).map(|o| o.attributes.clone())
    }

    pub fn props(&self, remote_id: &str) -> Option<ResolvedProps> {
        self.lock().objects.get(remote_id).map(|o| o.props.clone())
    }

    /// Delete an object behind the engine's back
    pub fn remove_out_of_band(&self, remote_id: &str) -> bool {
        self.lock().objects.remove(remote_id).is_some()
    }

    /// Wait until at least `n` calls have reached the account
    pub async fn wait_for_calls(&self, n: usize) {
        let mut count = self.call_count.subscribe();
        let _ = count.wait_for(|made| *made >= n).await;
    }

    /// Record the call, apply faults and mark it in flight
    pub(crate) fn begin(
        &self,
        kind: CallKind,
        resource_type: ResourceType,
        target: &str,
    ) -> Result<(InFlight, Duration), ProviderError> {
        let mut inner = self.lock();
        inner.calls.push(Call {
            kind,
            resource_type,
            target: target.to_string(),
        });
        self.call_count.send_replace(inner.calls.len());

        let matching = inner
            .faults
            .iter()
            .position(|rule| rule.matches(kind, resource_type, target));
        if let Some(index) = matching {
            let error = inner.faults[index].fire();
            tracing::debug!(
                "Injected fault on {} {} {}: {}",
                kind,
                resource_type,
                target,
                error
            );
            inner.faults.retain(|rule| !rule.exhausted());
            return Err(error);
        }

        inner.in_flight += 1;
        inner.peak_in_flight = inner.peak_in_flight.max(inner.in_flight);
        Ok((
            InFlight {
                inner: Arc::clone(&self.inner),
            },
            inner.latency,
        ))
    }

    pub(crate) fn create(
        &self,
        resource_type: ResourceType,
        props: &ResolvedProps,
    ) -> Result<CreatedResource, ProviderError> {
        if let Some(missing) = required_props(resource_type)
            .iter()
            .find(|key| props.get(**key).is_none_or(Value::is_null))
        {
            return Err(ProviderError::permanent(format!(
                "invalid {} configuration: missing {}",
                resource_type, missing
            )));
        }

        let mut inner = self.lock();
        let sequence = inner.sequence.entry(resource_type).or_insert(0);
        *sequence += 1;
        let n = *sequence;

        let name = props
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(resource_type.as_str())
            .to_string();
        let (remote_id, mut attributes) = materialize(resource_type, n, &name, props);
        attributes.insert("id".to_string(), json!(remote_id));

        inner.objects.insert(
            remote_id.clone(),
            RemoteObject {
                resource_type,
                props: props.clone(),
                attributes: attributes.clone(),
            },
        );
        tracing::debug!("Created {} {} ({})", resource_type, name, remote_id);
        Ok(CreatedResource::new(remote_id, attributes))
    }

    pub(crate) fn read(&self, remote_id: &str) -> Result<Attributes, ProviderError> {
        self.attributes(remote_id)
            .ok_or_else(|| ProviderError::NotFound(remote_id.to_string()))
    }

    pub(crate) fn update(
        &self,
        remote_id: &str,
        props: &ResolvedProps,
    ) -> Result<Attributes, ProviderError> {
        let mut inner = self.lock();
        let object = inner
            .objects
            .get_mut(remote_id)
            .ok_or_else(|| ProviderError::NotFound(remote_id.to_string()))?;
        object.props = props.clone();
        Ok(object.attributes.clone())
    }

    pub(crate) fn delete(&self, remote_id: &str) -> Result<(), ProviderError> {
        match self.lock().objects.remove(remote_id) {
            Some(_) => Ok(()),
            None => Err(ProviderError::NotFound(remote_id.to_string())),
        }
    }
}

fn elb_arn(kind: &str, name: &str, n: u32) -> String {
    format!(
        "arn:aws:elasticloadbalancing:{}:{}:{}/{}/{:016x}",
        REGION, ACCOUNT_ID, kind, name, n
    )
}

/// Remote id and attributes the provider assigns on create
fn materialize(
    resource_type: ResourceType,
    n: u32,
    name: &str,
    props: &ResolvedProps,
) -> (String, Attributes) {
    let prop = |key: &str| props.get(key).cloned().unwrap_or(Value::Null);
    let mut attributes = Attributes::new();

    let remote_id = match resource_type {
        ResourceType::Network => {
            let id = format!("vpc-{:017x}", n);
            attributes.insert("vpcId".into(), json!(id));
            let cidr = props.get("cidr").cloned();
            attributes.insert(
                "cidrBlock".into(),
                cidr.unwrap_or_else(|| json!("10.0.0.0/16")),
            );
            id
        }
        ResourceType::Subnet => {
            let id = format!("subnet-{:017x}", n);
            attributes.insert("subnetId".into(), json!(id));
            attributes.insert("vpcId".into(), prop("vpcId"));
            attributes.insert("cidrBlock".into(), prop("cidr"));
            attributes.insert("availabilityZone".into(), json!(format!("{}a", REGION)));
            id
        }
        ResourceType::SecurityGroup => {
            let id = format!("sg-{:017x}", n);
            attributes.insert("groupId".into(), json!(id));
            attributes.insert("vpcId".into(), prop("vpcId"));
            id
        }
        ResourceType::Instance => {
            let id = format!("i-{:017x}", n);
            attributes.insert("instanceId".into(), json!(id));
            attributes.insert("subnetId".into(), prop("subnetId"));
            let private_ip = format!("10.0.0.{}", 10 + n % 240);
            attributes.insert("privateIp".into(), json!(private_ip));
            attributes.insert("publicIp".into(), json!(format!("54.160.0.{}", n % 250)));
            id
        }
        ResourceType::LoadBalancer => {
            let arn = elb_arn("loadbalancer/app", name, n);
            attributes.insert("loadBalancerArn".into(), json!(arn));
            let dns_name = format!("{}-{}.{}.elb.amazonaws.com", name, 1_000_000 + n, REGION);
            attributes.insert("dnsName".into(), json!(dns_name));
            arn
        }
        ResourceType::TargetGroup => {
            let arn = elb_arn("targetgroup", name, n);
            attributes.insert("targetGroupArn".into(), json!(arn));
            attributes.insert("targetGroupName".into(), json!(name));
            arn
        }
        ResourceType::Listener => {
            let arn = elb_arn("listener/app", name, n);
            attributes.insert("listenerArn".into(), json!(arn));
            arn
        }
    };

    (remote_id, attributes)
}
