//! Resolution pipeline
//!
//! Descriptors -> extractors -> environment layer -> ambient identity layer
//! -> validator. One call resolves one pass; nothing is carried over from a
//! previous pass.

use super::bundle::ResolvedBundle;
use super::descriptor::Descriptor;
use super::extract::ExtractorRegistry;
use super::overrides::{apply_env_overrides, apply_identity, EnvSource, OverrideRule};
use super::validate::Validator;
use crate::identity::{fetch_bounded, AmbientIdentity};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Everything needed to turn descriptors into validated bundles
#[derive(Clone)]
pub struct Resolver {
    pub extractors: ExtractorRegistry,
    pub validator: Validator,
    pub rules: Vec<OverrideRule>,
    pub env: Arc<dyn EnvSource>,
    pub identity: Arc<dyn AmbientIdentity>,
    pub env_prefix: String,
    pub identity_timeout: Duration,
}

impl Resolver {
    /// Resolve every descriptor in `descriptors`
    pub async fn resolve<'a, I>(&self, descriptors: I) -> BTreeMap<String, ResolvedBundle>
    where
        I: IntoIterator<Item = &'a Descriptor>,
    {
        let descriptors: Vec<&Descriptor> = descriptors.into_iter().collect();

        let kinds: BTreeSet<&str> = descriptors.iter().map(|d| d.kind.as_str()).collect();
        let mut identities: HashMap<&str, Map<String, Value>> = HashMap::new();
        for kind in kinds {
            if let Some(fields) =
                fetch_bounded(self.identity.as_ref(), kind, self.identity_timeout).await
            {
                identities.insert(kind, fields);
            }
        }

        descriptors
            .into_iter()
            .map(|d| {
                let bundle = self.resolve_one(d, identities.get(d.kind.as_str()));
                (d.id.clone(), bundle)
            })
            .collect()
    }

    fn resolve_one(
        &self,
        descriptor: &Descriptor,
        identity: Option<&Map<String, Value>>,
    ) -> ResolvedBundle {
        let mut bundle = self.extractors.extract(descriptor);
        apply_env_overrides(&mut bundle, &self.rules, self.env.as_ref(), &self.env_prefix);
        if let Some(identity) = identity {
            apply_identity(&mut bundle, identity);
        }
        bundle.valid = self.validator.validate(&bundle);

        if !bundle.valid {
            tracing::debug!(
                "Resource '{}' ({}) is incomplete",
                bundle.descriptor_id,
                bundle.kind
            );
        }
        bundle
    }
}
