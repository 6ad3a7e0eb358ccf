//! Services a node hosts (or knows remotely), grouped by kind.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceKind {
    Api,
    File,
    DataSource,
}

/// One named service and where it actually lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    pub kind: ServiceKind,
    /// Base URL for APIs, a path for files and data sources.
    pub locator: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceEntry {
    pub name: String,
    pub resource: String,
}

/// Resource lists as they appear in configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(rename = "API", default)]
    pub api: Vec<ResourceEntry>,
    #[serde(rename = "FILE", default)]
    pub file: Vec<ResourceEntry>,
    #[serde(rename = "DATA_SOURCE", default)]
    pub data_source: Vec<ResourceEntry>,
}

impl Resources {
    fn entries(&self, kind: ServiceKind) -> &[ResourceEntry] {
        match kind {
            ServiceKind::Api => &self.api,
            ServiceKind::File => &self.file,
            ServiceKind::DataSource => &self.data_source,
        }
    }

    /// Look up a service of the given kind by name.
    pub fn find(&self, kind: ServiceKind, name: &str) -> Option<ServiceDescriptor> {
        self.entries(kind)
            .iter()
            .find(|e| e.name == name)
            .map(|e| ServiceDescriptor {
                name: e.name.clone(),
                kind,
                locator: e.resource.clone(),
            })
    }

    pub fn descriptors(&self) -> Vec<ServiceDescriptor> {
        [ServiceKind::Api, ServiceKind::File, ServiceKind::DataSource]
            .into_iter()
            .flat_map(|kind| {
                self.entries(kind).iter().map(move |e| ServiceDescriptor {
                    name: e.name.clone(),
                    kind,
                    locator: e.resource.clone(),
                })
            })
            .collect()
    }

    /// Distinct service names across all kinds, in declaration order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for descriptor in self.descriptors() {
            if !names.contains(&descriptor.name) {
                names.push(descriptor.name);
            }
        }
        names
    }

    pub fn is_empty(&self) -> bool {
        self.api.is_empty() && self.file.is_empty() && self.data_source.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Resources {
        serde_json::from_str(
            r#"{
                "API": [{"name": "lab-results", "resource": "http://127.0.0.1:3000/lab"}],
                "FILE": [{"name": "report.pdf", "resource": "/srv/files/report.pdf"}],
                "DATA_SOURCE": [{"name": "admissions", "resource": "/srv/data/admissions.parquet"}]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn find_by_kind() {
        let resources = sample();
        let api = resources.find(ServiceKind::Api, "lab-results").unwrap();
        assert_eq!(api.locator, "http://127.0.0.1:3000/lab");
        assert!(resources.find(ServiceKind::File, "lab-results").is_none());
        assert!(resources.find(ServiceKind::DataSource, "admissions").is_some());
    }

    #[test]
    fn descriptors_and_names() {
        let resources = sample();
        assert_eq!(resources.descriptors().len(), 3);
        assert_eq!(
            resources.names(),
            vec!["lab-results", "report.pdf", "admissions"]
        );
    }

    #[test]
    fn missing_lists_default_empty() {
        let resources: Resources = serde_json::from_str("{}").unwrap();
        assert!(resources.is_empty());
    }
}
