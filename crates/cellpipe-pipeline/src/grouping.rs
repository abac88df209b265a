//! Partitioning image numbers into groups by metadata values.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::measurements::{IMAGE, MeasurementsStore};

/// Key name to key value, identifying one group.
pub type GroupKey = BTreeMap<String, String>;

/// One group of image numbers sharing the same key values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Key values shared by every image in the group.
    pub key: GroupKey,
    /// Image numbers, in processing order.
    pub image_numbers: Vec<usize>,
}

/// The groups of a run and the key names that define them.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Groupings {
    /// Names of the grouping keys (empty for the implicit single group).
    pub key_names: Vec<String>,
    /// Groups in processing order.
    pub groups: Vec<Group>,
}

impl Groupings {
    /// One group without keys holding every image number.
    #[must_use]
    pub fn single(image_numbers: Vec<usize>) -> Self {
        Self {
            key_names: Vec::new(),
            groups: vec![Group {
                key: GroupKey::new(),
                image_numbers,
            }],
        }
    }

    /// Group the store's image numbers by the values of image features.
    ///
    /// Groups appear in order of their first image number. Images missing a
    /// key feature are grouped under an empty value.
    #[must_use]
    pub fn by_image_features(store: &dyn MeasurementsStore, key_names: &[String]) -> Self {
        let mut groups: Vec<Group> = Vec::new();
        for image_number in store.get_image_numbers() {
            let key: GroupKey = key_names
                .iter()
                .map(|name| {
                    let value = store
                        .get_measurement(IMAGE, name, image_number)
                        .map(ToString::to_string)
                        .unwrap_or_default();
                    (name.clone(), value)
                })
                .collect();
            match groups.iter_mut().find(|g| g.key == key) {
                Some(group) => group.image_numbers.push(image_number),
                None => groups.push(Group {
                    key,
                    image_numbers: vec![image_number],
                }),
            }
        }
        Self {
            key_names: key_names.to_vec(),
            groups,
        }
    }

    /// Whether `request` names exactly this grouping's keys.
    #[must_use]
    pub fn accepts_request(&self, request: &GroupKey) -> bool {
        request.len() == self.key_names.len()
            && self.key_names.iter().all(|name| request.contains_key(name))
    }

    /// Every image number across all groups, in processing order.
    pub fn image_numbers(&self) -> impl Iterator<Item = usize> + '_ {
        self.groups.iter().flat_map(|g| g.image_numbers.iter().copied())
    }
}
