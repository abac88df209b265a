//! Module settings: a text label, a string value, and a role that tells the
//! dependency analysis whether the setting names something the module
//! produces or consumes.

use serde::{Deserialize, Serialize};

/// Value used by name-provider settings that are switched off.
pub const DO_NOT_USE: &str = "Do not use";

/// The kinds of named things modules exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Namespace {
    /// Named images (e.g. `"DNA"`).
    Image,
    /// Named object sets (e.g. `"Nuclei"`).
    Object,
    /// `(object, feature)` measurements.
    Measurement,
}

impl Namespace {
    /// All namespaces in a fixed order.
    pub const ALL: [Self; 3] = [Self::Image, Self::Object, Self::Measurement];
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Image => "image",
            Self::Object => "object",
            Self::Measurement => "measurement",
        };
        f.write_str(name)
    }
}

/// How a setting participates in dependency analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettingRole {
    /// An ordinary value.
    Plain,
    /// The value names an image or object set this module creates.
    Provider(Namespace),
    /// The value names an image or object set this module consumes.
    Subscriber(Namespace),
    /// The value is a feature name of `object_name` this module consumes.
    MeasurementRef {
        /// Object (or `"Image"`) the feature belongs to.
        object_name: String,
    },
}

/// One entry of a module's ordered settings list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Setting {
    /// Human-readable label, written to the pipeline file beside the value.
    pub text: String,
    /// Current value in its serialized string form.
    pub value: String,
    /// Dependency role.
    pub role: SettingRole,
}

impl Setting {
    /// A plain setting.
    pub fn new(text: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            value: value.into(),
            role: SettingRole::Plain,
        }
    }

    /// A setting naming something this module provides.
    pub fn provider(namespace: Namespace, text: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            role: SettingRole::Provider(namespace),
            ..Self::new(text, value)
        }
    }

    /// A setting naming something this module subscribes to.
    pub fn subscriber(
        namespace: Namespace,
        text: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            role: SettingRole::Subscriber(namespace),
            ..Self::new(text, value)
        }
    }

    /// A setting naming a feature of `object_name`.
    pub fn measurement(
        object_name: impl Into<String>,
        text: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            role: SettingRole::MeasurementRef {
                object_name: object_name.into(),
            },
            ..Self::new(text, value)
        }
    }

    /// The namespace this setting provides, if it is an active provider.
    #[must_use]
    pub fn provided(&self) -> Option<Namespace> {
        match self.role {
            SettingRole::Provider(ns) if self.value != DO_NOT_USE => Some(ns),
            _ => None,
        }
    }
}

/// Parse a Yes/No setting value.
#[must_use]
pub fn parse_binary(value: &str) -> Option<bool> {
    match value {
        "Yes" => Some(true),
        "No" => Some(false),
        _ => None,
    }
}

/// Format a boolean as a Yes/No setting value.
#[must_use]
pub const fn format_binary(value: bool) -> &'static str {
    if value { "Yes" } else { "No" }
}
