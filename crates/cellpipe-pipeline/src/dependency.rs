//! Which module produces what each module consumes.
//!
//! Providers are indexed per namespace by scanning modules in order; each
//! subscriber is then linked to the first provider that runs before it.

use std::collections::BTreeMap;
use std::fmt;

use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};

use crate::pipeline::Pipeline;
pub use crate::setting::Namespace;
use crate::setting::{DO_NOT_USE, SettingRole};

/// Key of the provider index: a name, or an `(object, feature)` pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProviderKey {
    /// An image or object set name.
    Name(String),
    /// A measurement.
    Measurement {
        /// Object (or `"Image"`) name.
        object_name: String,
        /// Feature name.
        feature: String,
    },
}

impl ProviderKey {
    /// Shorthand for [`ProviderKey::Name`].
    pub fn name(name: impl Into<String>) -> Self {
        Self::Name(name.into())
    }
}

/// A module that provides a name, and the setting that names it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    /// One-based module number.
    pub module_num: usize,
    /// Index into the module's visible settings; `None` for implicit
    /// providers and measurement columns.
    pub setting_index: Option<usize>,
}

/// What flows along a dependency edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DependencyKind {
    /// A named image.
    Image {
        /// Image name.
        name: String,
    },
    /// A named object set.
    Object {
        /// Object set name.
        name: String,
    },
    /// A measurement.
    Measurement {
        /// Object (or `"Image"`) name.
        object_name: String,
        /// Feature name.
        feature: String,
    },
}

/// One edge of the dependency graph. `source < destination` always holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    /// Module number of the provider.
    pub source: usize,
    /// Module number of the consumer.
    pub destination: usize,
    /// Providing setting, as an index into the provider's visible settings.
    pub source_setting: Option<usize>,
    /// Consuming setting, as an index into the consumer's visible settings.
    pub destination_setting: usize,
    /// What is consumed.
    pub kind: DependencyKind,
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            DependencyKind::Image { name } => write!(f, "Image: {name}"),
            DependencyKind::Object { name } => write!(f, "Object: {name}"),
            DependencyKind::Measurement { object_name, feature } => {
                write!(f, "Measurement: {object_name}.{feature}")
            }
        }
    }
}

type ProviderIndex = BTreeMap<ProviderKey, Vec<Provider>>;

impl Pipeline {
    /// Index of everything provided in `namespace`.
    ///
    /// Without `before`, every provider of a name is listed in module
    /// order. With `before`, only modules numbered lower than it are
    /// scanned and each name keeps just its most recent provider.
    #[must_use]
    pub fn get_provider_dictionary(&self, namespace: Namespace, before: Option<usize>) -> ProviderIndex {
        let mut index = ProviderIndex::new();
        let mut record = |key: ProviderKey, provider: Provider| {
            let entry = index.entry(key).or_default();
            if before.is_some() {
                entry.clear();
            }
            entry.push(provider);
        };
        for pm in self.modules() {
            if before.is_some_and(|b| pm.module_num() >= b) {
                break;
            }
            let module_num = pm.module_num();
            let module = pm.module();
            for name in module.other_providers(namespace) {
                record(
                    ProviderKey::Name(name),
                    Provider {
                        module_num,
                        setting_index: None,
                    },
                );
            }
            if namespace == Namespace::Measurement {
                for column in module.get_measurement_columns(self) {
                    record(
                        ProviderKey::Measurement {
                            object_name: column.object_name,
                            feature: column.feature,
                        },
                        Provider {
                            module_num,
                            setting_index: None,
                        },
                    );
                }
            }
            for (i, setting) in module.visible_settings().into_iter().enumerate() {
                if setting.role == SettingRole::Provider(namespace) && setting.value != DO_NOT_USE {
                    record(
                        ProviderKey::Name(setting.value),
                        Provider {
                            module_num,
                            setting_index: Some(i),
                        },
                    );
                }
            }
        }
        index
    }

    /// Every dependency between modules, in consumer order.
    ///
    /// Each consuming setting links to the first provider that runs
    /// before it; names provided only later (or by the consumer itself)
    /// are left unconnected.
    #[must_use]
    pub fn get_dependency_graph(&self) -> Vec<Dependency> {
        let images = self.get_provider_dictionary(Namespace::Image, None);
        let objects = self.get_provider_dictionary(Namespace::Object, None);
        let measurements = self.get_provider_dictionary(Namespace::Measurement, None);

        let mut result = Vec::new();
        for pm in self.modules() {
            let destination = pm.module_num();
            for (destination_setting, setting) in pm.module().visible_settings().into_iter().enumerate() {
                let (index, key, kind) = match setting.role {
                    SettingRole::Subscriber(Namespace::Image) => (
                        &images,
                        ProviderKey::Name(setting.value.clone()),
                        DependencyKind::Image { name: setting.value },
                    ),
                    SettingRole::Subscriber(Namespace::Object) => (
                        &objects,
                        ProviderKey::Name(setting.value.clone()),
                        DependencyKind::Object { name: setting.value },
                    ),
                    SettingRole::MeasurementRef { object_name } => (
                        &measurements,
                        ProviderKey::Measurement {
                            object_name: object_name.clone(),
                            feature: setting.value.clone(),
                        },
                        DependencyKind::Measurement {
                            object_name,
                            feature: setting.value,
                        },
                    ),
                    SettingRole::Plain | SettingRole::Provider(_) | SettingRole::Subscriber(Namespace::Measurement) => {
                        continue;
                    }
                };
                let first = index
                    .get(&key)
                    .and_then(|providers| providers.iter().find(|p| p.module_num < destination));
                if let Some(provider) = first {
                    result.push(Dependency {
                        source: provider.module_num,
                        destination,
                        source_setting: provider.setting_index,
                        destination_setting,
                        kind,
                    });
                }
            }
        }
        result
    }

    /// The dependency list as a graph with one node per module.
    ///
    /// Node `i` carries module number `i + 1`; edges point from provider to
    /// consumer.
    #[must_use]
    pub fn dependency_digraph(&self) -> DiGraph<usize, Dependency> {
        let mut graph = DiGraph::with_capacity(self.len(), 0);
        let nodes: Vec<NodeIndex> = self.modules().iter().map(|pm| graph.add_node(pm.module_num())).collect();
        for dependency in self.get_dependency_graph() {
            let from = nodes[dependency.source - 1];
            let to = nodes[dependency.destination - 1];
            graph.add_edge(from, to, dependency);
        }
        graph
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use petgraph::algo::toposort;

    use super::*;
    use crate::setting::SettingRole;
    use crate::test_support::{MockModule, pipeline_of};

    fn sample() -> Pipeline {
        pipeline_of(vec![
            MockModule::new("Alpha").providing(Namespace::Image, "DNA"),
            MockModule::new("Beta")
                .subscribing(Namespace::Image, "DNA")
                .providing(Namespace::Object, "Nuclei")
                .with_column("Nuclei", "Area"),
            MockModule::new("Gamma")
                .subscribing(Namespace::Object, "Nuclei")
                .subscribing(Namespace::Image, "Later")
                .with_setting(
                    SettingRole::MeasurementRef {
                        object_name: "Nuclei".into(),
                    },
                    "Area",
                ),
            MockModule::new("Delta").providing(Namespace::Image, "Later"),
        ])
    }

    #[test]
    fn links_consumers_to_earlier_providers() {
        let deps = sample().get_dependency_graph();
        let described: Vec<(usize, usize, String)> = deps
            .iter()
            .map(|d| (d.source, d.destination, d.to_string()))
            .collect();
        assert_eq!(
            described,
            vec![
                (1, 2, "Image: DNA".to_string()),
                (2, 3, "Object: Nuclei".to_string()),
                (2, 3, "Measurement: Nuclei.Area".to_string()),
            ]
        );
        assert!(deps.iter().all(|d| d.source < d.destination));
        assert_eq!(deps[0].source_setting, Some(0));
        assert_eq!(deps[1].destination_setting, 0);
        assert_eq!(deps[2].source_setting, None);
    }

    #[test]
    fn first_earlier_provider_wins() {
        let p = pipeline_of(vec![
            MockModule::new("Alpha").providing(Namespace::Image, "DNA"),
            MockModule::new("Beta").providing(Namespace::Image, "DNA"),
            MockModule::new("Gamma").subscribing(Namespace::Image, "DNA"),
        ]);
        let deps = p.get_dependency_graph();
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].source, 1);
    }

    #[test]
    fn targeted_dictionary_keeps_latest_provider() {
        let p = pipeline_of(vec![
            MockModule::new("Alpha").providing(Namespace::Image, "DNA"),
            MockModule::new("Beta")
                .providing(Namespace::Image, "DNA")
                .with_other_provider(Namespace::Image, "Mask"),
            MockModule::new("Gamma").providing(Namespace::Image, "DNA"),
        ]);
        let all = p.get_provider_dictionary(Namespace::Image, None);
        assert_eq!(all[&ProviderKey::name("DNA")].len(), 3);

        let before = p.get_provider_dictionary(Namespace::Image, Some(3));
        assert_eq!(
            before[&ProviderKey::name("DNA")],
            vec![Provider {
                module_num: 2,
                setting_index: Some(0)
            }]
        );
        assert_eq!(before[&ProviderKey::name("Mask")][0].setting_index, None);
    }

    #[test]
    fn switched_off_provider_is_ignored() {
        let p = pipeline_of(vec![
            MockModule::new("Alpha").providing(Namespace::Image, DO_NOT_USE),
            MockModule::new("Beta").subscribing(Namespace::Image, DO_NOT_USE),
        ]);
        assert!(p.get_provider_dictionary(Namespace::Image, None).is_empty());
        assert!(p.get_dependency_graph().is_empty());
    }

    #[test]
    fn digraph_orders_like_the_pipeline() {
        let graph = sample().dependency_digraph();
        assert_eq!(graph.node_count(), 4);
        assert_eq!(graph.edge_count(), 3);
        let order: Vec<usize> = toposort(&graph, None).unwrap().into_iter().map(|n| graph[n]).collect();
        let position = |m: usize| order.iter().position(|&x| x == m).unwrap();
        assert!(position(1) < position(2));
        assert!(position(2) < position(3));
    }
}
