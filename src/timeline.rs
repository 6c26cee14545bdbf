//! Resolved timeline state and layer mappings
//!
//! The timeline resolver itself lives outside this crate; these are the
//! shapes it hands over. Device kinds form a closed set so content and
//! mapping options are tagged enums keyed by device type.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::devices::abstract_device::{AbstractContent, AbstractMapping};
use crate::devices::gsaas::{GsaasContent, GsaasMapping};
use crate::devices::quantel::{QuantelContent, QuantelMapping};
use crate::devices::sisyfos::{SisyfosContent, SisyfosMapping};

/// Device kinds known to the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceType {
    Abstract,
    Sisyfos,
    BbcGsaas,
    Quantel,
}

impl DeviceType {
    pub fn all() -> &'static [DeviceType] {
        &[
            DeviceType::Abstract,
            DeviceType::Sisyfos,
            DeviceType::BbcGsaas,
            DeviceType::Quantel,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Abstract => "abstract",
            DeviceType::Sisyfos => "sisyfos",
            DeviceType::BbcGsaas => "bbcGsaas",
            DeviceType::Quantel => "quantel",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// "What should be on every layer at time T"
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineState {
    /// Nominal time of the state (ms, same clock as the device instances)
    pub time: i64,
    #[serde(default)]
    pub layers: BTreeMap<String, ResolvedLayer>,
    #[serde(default)]
    pub next_events: Vec<NextEvent>,
}

impl TimelineState {
    pub fn new(time: i64) -> Self {
        Self {
            time,
            layers: BTreeMap::new(),
            next_events: Vec::new(),
        }
    }

    pub fn with_layer(mut self, name: impl Into<String>, layer: ResolvedLayer) -> Self {
        self.layers.insert(name.into(), layer);
        self
    }
}

/// Winning timeline object of one layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedLayer {
    /// Timeline object id
    pub id: String,
    pub content: TimelineContent,
    /// Start of the object instance, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<i64>,
    #[serde(default)]
    pub is_lookahead: bool,
    /// Layer this lookahead object previews
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookahead_for_layer: Option<String>,
}

impl ResolvedLayer {
    pub fn new(id: impl Into<String>, content: TimelineContent) -> Self {
        Self {
            id: id.into(),
            content,
            start: None,
            is_lookahead: false,
            lookahead_for_layer: None,
        }
    }

    pub fn lookahead_for(mut self, layer: impl Into<String>) -> Self {
        self.is_lookahead = true;
        self.lookahead_for_layer = Some(layer.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextEvent {
    pub time: i64,
    pub obj_id: String,
}

/// Device specific content of a timeline object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "deviceType", rename_all = "camelCase")]
pub enum TimelineContent {
    Abstract(AbstractContent),
    Sisyfos(SisyfosContent),
    BbcGsaas(GsaasContent),
    Quantel(QuantelContent),
}

impl TimelineContent {
    pub fn device_type(&self) -> DeviceType {
        match self {
            TimelineContent::Abstract(_) => DeviceType::Abstract,
            TimelineContent::Sisyfos(_) => DeviceType::Sisyfos,
            TimelineContent::BbcGsaas(_) => DeviceType::BbcGsaas,
            TimelineContent::Quantel(_) => DeviceType::Quantel,
        }
    }
}

/// Binds a timeline layer to a device and device-specific addressing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mapping {
    pub device_id: String,
    /// Display name of the layer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer_name: Option<String>,
    #[serde(flatten)]
    pub options: MappingOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "device", content = "options", rename_all = "camelCase")]
pub enum MappingOptions {
    Abstract(AbstractMapping),
    Sisyfos(SisyfosMapping),
    BbcGsaas(GsaasMapping),
    Quantel(QuantelMapping),
}

impl Mapping {
    pub fn new(device_id: impl Into<String>, options: MappingOptions) -> Self {
        Self {
            device_id: device_id.into(),
            layer_name: None,
            options,
        }
    }

    pub fn device_type(&self) -> DeviceType {
        match self.options {
            MappingOptions::Abstract(_) => DeviceType::Abstract,
            MappingOptions::Sisyfos(_) => DeviceType::Sisyfos,
            MappingOptions::BbcGsaas(_) => DeviceType::BbcGsaas,
            MappingOptions::Quantel(_) => DeviceType::Quantel,
        }
    }
}

/// Layer name -> mapping
pub type Mappings = BTreeMap<String, Mapping>;

/// Mappings that target a single device
pub fn mappings_for_device(mappings: &Mappings, device_id: &str) -> Mappings {
    mappings
        .iter()
        .filter(|(_, m)| m.device_id == device_id)
        .map(|(layer, m)| (layer.clone(), m.clone()))
        .collect()
}

/// Find the mapping a resolved layer should use
///
/// Lookahead objects without a mapping of their own fall back to the
/// mapping of the layer they preview. The returned flag tells whether the
/// fallback was used.
pub fn resolve_mapping<'a>(
    mappings: &'a Mappings,
    layer_name: &str,
    layer: &ResolvedLayer,
) -> Option<(&'a Mapping, bool)> {
    if let Some(mapping) = mappings.get(layer_name) {
        return Some((mapping, false));
    }
    if layer.is_lookahead {
        if let Some(original) = layer.lookahead_for_layer.as_deref() {
            return mappings.get(original).map(|m| (m, true));
        }
    }
    None
}
