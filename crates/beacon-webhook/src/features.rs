//! Injection capabilities and the per-Pod decision about which apply
//!
//! A Pod opts in or out of each [`Capability`] with an annotation. The
//! resulting [`InjectionInfo`] renders canonically so the idempotency marker
//! written on first injection is the same string no matter how the
//! annotations were ordered.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use beacon_common::kube_utils::get_field_bool;

use crate::annotations;

/// Something the webhook can inject into a Pod
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Capability {
    /// The monitoring agent, preloaded into every application container
    OneAgent,
    /// Data-ingest enrichment files and endpoint credentials
    DataIngest,
}

impl Capability {
    /// All capabilities
    pub const ALL: [Capability; 2] = [Capability::OneAgent, Capability::DataIngest];

    /// Token used in the idempotency marker and annotation prefixes
    pub fn token(&self) -> &'static str {
        match self {
            Self::OneAgent => "oneagent",
            Self::DataIngest => "data-ingest",
        }
    }

    /// Annotation that switches this capability on or off
    pub fn inject_annotation(&self) -> &'static str {
        match self {
            Self::OneAgent => annotations::ONEAGENT_INJECT,
            Self::DataIngest => annotations::DATA_INGEST_INJECT,
        }
    }

    /// Annotation recording whether this capability was injected
    pub fn injected_annotation(&self) -> &'static str {
        match self {
            Self::OneAgent => annotations::ONEAGENT_INJECTED,
            Self::DataIngest => annotations::DATA_INGEST_INJECTED,
        }
    }
}

// Ordered by token so the rendering is lexicographic.
impl Ord for Capability {
    fn cmp(&self, other: &Self) -> Ordering {
        self.token().cmp(other.token())
    }
}

impl PartialOrd for Capability {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Which capabilities are enabled for one Pod
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InjectionInfo {
    features: BTreeMap<Capability, bool>,
}

impl InjectionInfo {
    /// Build from explicit capability switches
    pub fn new(features: impl IntoIterator<Item = (Capability, bool)>) -> Self {
        Self {
            features: features.into_iter().collect(),
        }
    }

    /// Read the capability switches from Pod annotations.
    ///
    /// Each capability defaults to the global `beacon.dev/inject` switch,
    /// which itself defaults to enabled.
    pub fn from_annotations(pod_annotations: Option<&BTreeMap<String, String>>) -> Self {
        let default = get_field_bool(pod_annotations, annotations::INJECT, true);
        Self::new(Capability::ALL.map(|capability| {
            (
                capability,
                get_field_bool(pod_annotations, capability.inject_annotation(), default),
            )
        }))
    }

    /// Force a capability off
    pub fn without(mut self, capability: Capability) -> Self {
        self.features.insert(capability, false);
        self
    }

    /// At least one capability is enabled
    pub fn any_enabled(&self) -> bool {
        self.features.values().any(|enabled| *enabled)
    }

    /// The given capability is enabled
    pub fn is_enabled(&self, capability: Capability) -> bool {
        self.features.get(&capability).copied().unwrap_or(false)
    }

    /// Enabled capabilities in canonical order
    pub fn enabled(&self) -> impl Iterator<Item = Capability> + '_ {
        self.features
            .iter()
            .filter(|(_, enabled)| **enabled)
            .map(|(capability, _)| *capability)
    }

    /// Canonical rendering: enabled tokens, sorted, comma-joined
    pub fn render(&self) -> String {
        self.enabled()
            .map(|c| c.token())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Marker and per-capability annotations written on first injection
    pub fn injected_annotations(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        out.insert(annotations::INJECTED.to_string(), self.render());
        for capability in Capability::ALL {
            out.insert(
                capability.injected_annotation().to_string(),
                self.is_enabled(capability).to_string(),
            );
        }
        out
    }
}
