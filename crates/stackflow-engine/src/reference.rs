//! Published attributes of created resources
//!
//! The store is the single point where workers hand results to later
//! batches. Each node id is published at most once per run.

use crate::error::{EngineError, NotReadyError, Result};
use crate::resource::{Attributes, PropValue, ResolvedProps, resolve_props};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard};

type Published = HashMap<String, Attributes>;

#[derive(Debug, Default)]
pub struct ReferenceStore {
    published: RwLock<Published>,
}

impl ReferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish the attributes of a node that has reached `Created`
    pub fn put(&self, node_id: impl Into<String>, attributes: Attributes) -> Result<()> {
        let node_id = node_id.into();
        let mut published = self
            .published
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if published.contains_key(&node_id) {
            return Err(EngineError::AlreadyPublished(node_id));
        }

        tracing::debug!("Published {} attributes for {}", attributes.len(), node_id);
        published.insert(node_id, attributes);
        Ok(())
    }

    /// Look up a single attribute of a created node
    pub fn resolve(
        &self,
        node_id: &str,
        attribute: &str,
    ) -> std::result::Result<Value, NotReadyError> {
        let published = self.read();

        let attributes = published
            .get(node_id)
            .ok_or_else(|| NotReadyError::NodeNotCreated {
                node: node_id.to_string(),
                attribute: attribute.to_string(),
            })?;

        attributes
            .get(attribute)
            .cloned()
            .ok_or_else(|| NotReadyError::MissingAttribute {
                node: node_id.to_string(),
                attribute: attribute.to_string(),
            })
    }

    /// Substitute every reference in a property map
    pub fn resolve_props(
        &self,
        props: &BTreeMap<String, PropValue>,
    ) -> std::result::Result<ResolvedProps, NotReadyError> {
        resolve_props(props, |reference| {
            self.resolve(&reference.node, &reference.attribute)
        })
    }

    /// Number of nodes published so far
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> RwLockReadGuard<'_, Published> {
        self.published
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
