//! Artifact consolidation and the run-scoped in-memory artifact store.

use async_trait::async_trait;
use gantry_core::artifact::{Artifact, ConsolidatedArtifact, ConsolidatedFile};
use gantry_core::error::ConsolidationConflictError;
use gantry_core::ids::RunId;
use gantry_core::ports::ArtifactStore;
use gantry_core::{Error, Result};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// Merges same-name artifacts from several producers into one bundle.
pub struct ArtifactConsolidator;

impl ArtifactConsolidator {
    pub fn new() -> Self {
        Self
    }

    /// Union the variants of `name` by relative path.
    ///
    /// The result does not depend on the order of `artifacts`. `always`
    /// artifacts are placed under `<producer>/` and never collide with each
    /// other; a regular file already at that path is a conflict.
    pub fn consolidate(
        &self,
        name: &str,
        artifacts: &[Artifact],
    ) -> std::result::Result<ConsolidatedArtifact, ConsolidationConflictError> {
        let mut variants: Vec<&Artifact> = artifacts.iter().filter(|a| a.name == name).collect();
        variants.sort_by(|a, b| a.producer.cmp(&b.producer));

        let mut bundle = ConsolidatedArtifact::empty(name);

        for artifact in variants.iter().filter(|a| !a.always) {
            bundle.contributors.insert(artifact.producer.clone());
            for (relative, source) in &artifact.files {
                if let Some(existing) = bundle.files.get(relative) {
                    if existing.producer == artifact.producer {
                        continue;
                    }
                    return Err(ConsolidationConflictError {
                        artifact: name.to_string(),
                        path: relative.clone(),
                        first: existing.producer.to_string(),
                        second: artifact.producer.to_string(),
                    });
                }
                bundle.files.insert(
                    relative.clone(),
                    ConsolidatedFile {
                        source: source.clone(),
                        producer: artifact.producer.clone(),
                    },
                );
            }
        }

        for artifact in variants.iter().filter(|a| a.always) {
            bundle.contributors.insert(artifact.producer.clone());
            for (relative, source) in &artifact.files {
                let namespaced = format!("{}/{relative}", artifact.producer);
                // Only a regular file laid out under another job's name can be here.
                if let Some(existing) = bundle.files.get(&namespaced) {
                    return Err(ConsolidationConflictError {
                        artifact: name.to_string(),
                        path: namespaced,
                        first: existing.producer.to_string(),
                        second: artifact.producer.to_string(),
                    });
                }
                bundle.files.insert(
                    namespaced,
                    ConsolidatedFile {
                        source: source.clone(),
                        producer: artifact.producer.clone(),
                    },
                );
            }
        }

        debug!(
            artifact = %name,
            contributors = bundle.contributors.len(),
            files = bundle.files.len(),
            "Artifact consolidated"
        );
        Ok(bundle)
    }
}

impl Default for ArtifactConsolidator {
    fn default() -> Self {
        Self::new()
    }
}

/// Artifact store that lives for the duration of a process.
#[derive(Default)]
pub struct InMemoryArtifactStore {
    entries: RwLock<HashMap<(RunId, String), Vec<Artifact>>>,
    consolidator: ArtifactConsolidator,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop everything stored for a run.
    pub async fn clear(&self, run_id: RunId) {
        self.entries.write().await.retain(|(id, _), _| *id != run_id);
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn create(&self, run_id: RunId, name: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        let key = (run_id, name.to_string());
        if entries.contains_key(&key) {
            return Err(Error::ArtifactExists(name.to_string()));
        }
        entries.insert(key, Vec::new());
        Ok(())
    }

    async fn append(&self, run_id: RunId, artifact: Artifact) -> Result<()> {
        let mut entries = self.entries.write().await;
        let variants = entries
            .entry((run_id, artifact.name.clone()))
            .or_default();

        if variants.iter().any(|v| v.producer == artifact.producer) {
            return Err(Error::ArtifactConflict {
                name: artifact.name,
                producer: artifact.producer.to_string(),
            });
        }

        debug!(
            %run_id,
            artifact = %artifact.name,
            producer = %artifact.producer,
            files = artifact.files.len(),
            "Artifact variant stored"
        );
        variants.push(artifact);
        Ok(())
    }

    async fn fetch_consolidated(&self, run_id: RunId, name: &str) -> Result<ConsolidatedArtifact> {
        let entries = self.entries.read().await;
        let variants = entries
            .get(&(run_id, name.to_string()))
            .ok_or_else(|| Error::ArtifactNotFound(name.to_string()))?;
        Ok(self.consolidator.consolidate(name, variants)?)
    }

    async fn list(&self, run_id: RunId) -> Result<Vec<Artifact>> {
        let entries = self.entries.read().await;
        let mut artifacts: Vec<Artifact> = entries
            .iter()
            .filter(|((id, _), _)| *id == run_id)
            .flat_map(|(_, variants)| variants.iter().cloned())
            .collect();
        artifacts.sort_by(|a, b| (&a.name, &a.producer).cmp(&(&b.name, &b.producer)));
        Ok(artifacts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::ids::JobKey;
    use pretty_assertions::assert_eq;

    fn librocksdb(arch: &str) -> Artifact {
        Artifact::new("librocksdb", JobKey::new(format!("build_{arch}")), "BuildLibrocksdb")
            .with_file(format!("{arch}/librocksdb.so"), format!("/work/{arch}/librocksdb.so"))
    }

    #[test]
    fn test_consolidation_is_order_independent() {
        let consolidator = ArtifactConsolidator::new();
        let x = librocksdb("amd64");
        let y = librocksdb("arm64v8");

        let forward = consolidator.consolidate("librocksdb", &[x.clone(), y.clone()]).unwrap();
        let backward = consolidator.consolidate("librocksdb", &[y, x]).unwrap();

        assert_eq!(forward, backward);
        assert_eq!(forward.len(), 2);
        assert_eq!(forward.contributors.len(), 2);
    }

    #[test]
    fn test_collision_is_reported_in_any_order() {
        let consolidator = ArtifactConsolidator::new();
        let a = Artifact::new("packages", JobKey::new("package_a"), "Package")
            .with_file("edgelet.deb", "/a/edgelet.deb");
        let b = Artifact::new("packages", JobKey::new("package_b"), "Package")
            .with_file("edgelet.deb", "/b/edgelet.deb");

        let e1 = consolidator.consolidate("packages", &[a.clone(), b.clone()]).unwrap_err();
        let e2 = consolidator.consolidate("packages", &[b, a]).unwrap_err();

        assert_eq!(e1, e2);
        assert_eq!(e1.path, "edgelet.deb");
        assert_eq!(e1.first, "package_a");
        assert_eq!(e1.second, "package_b");
    }

    #[test]
    fn test_always_artifacts_are_namespaced() {
        let consolidator = ArtifactConsolidator::new();
        let a = Artifact::new("logs", JobKey::new("build_amd64"), "Build")
            .always()
            .with_file("build.log", "/a/build.log");
        let b = Artifact::new("logs", JobKey::new("build_arm64"), "Build")
            .always()
            .with_file("build.log", "/b/build.log");

        let bundle = consolidator.consolidate("logs", &[a, b]).unwrap();
        let paths: Vec<&str> = bundle.files.keys().map(String::as_str).collect();
        assert_eq!(paths, vec!["build_amd64/build.log", "build_arm64/build.log"]);
    }

    #[test]
    fn test_always_file_shadowed_by_regular_file_is_reported() {
        let consolidator = ArtifactConsolidator::new();
        let log = Artifact::new("logs", JobKey::new("build_amd64"), "Build")
            .always()
            .with_file("build.log", "/a/build.log");
        let regular = Artifact::new("logs", JobKey::new("collect"), "Build")
            .with_file("build_amd64/build.log", "/c/build.log");

        let e1 = consolidator
            .consolidate("logs", &[log.clone(), regular.clone()])
            .unwrap_err();
        let e2 = consolidator.consolidate("logs", &[regular, log]).unwrap_err();

        assert_eq!(e1, e2);
        assert_eq!(e1.path, "build_amd64/build.log");
        assert_eq!(e1.first, "collect");
        assert_eq!(e1.second, "build_amd64");
    }

    #[test]
    fn test_empty_input_yields_empty_bundle() {
        let bundle = ArtifactConsolidator::new().consolidate("nothing", &[]).unwrap();
        assert!(bundle.is_empty());
        assert!(bundle.contributors.is_empty());
    }

    #[tokio::test]
    async fn test_store_rejects_second_variant_from_same_producer() {
        let store = InMemoryArtifactStore::new();
        let run_id = RunId::new();

        store.append(run_id, librocksdb("amd64")).await.unwrap();
        let err = store.append(run_id, librocksdb("amd64")).await.unwrap_err();
        assert!(matches!(err, Error::ArtifactConflict { .. }));
    }

    #[tokio::test]
    async fn test_store_create_and_fetch() {
        let store = InMemoryArtifactStore::new();
        let run_id = RunId::new();

        store.create(run_id, "librocksdb").await.unwrap();
        assert!(matches!(
            store.create(run_id, "librocksdb").await,
            Err(Error::ArtifactExists(_))
        ));
        assert!(store.fetch_consolidated(run_id, "librocksdb").await.unwrap().is_empty());

        store.append(run_id, librocksdb("amd64")).await.unwrap();
        store.append(run_id, librocksdb("arm64v8")).await.unwrap();
        assert_eq!(store.fetch_consolidated(run_id, "librocksdb").await.unwrap().len(), 2);

        assert!(matches!(
            store.fetch_consolidated(run_id, "missing").await,
            Err(Error::ArtifactNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_store_is_scoped_per_run() {
        let store = InMemoryArtifactStore::new();
        let first = RunId::new();
        let second = RunId::new();

        store.append(first, librocksdb("amd64")).await.unwrap();
        store.append(second, librocksdb("amd64")).await.unwrap();
        assert_eq!(store.list(first).await.unwrap().len(), 1);

        store.clear(first).await;
        assert!(store.list(first).await.unwrap().is_empty());
        assert_eq!(store.list(second).await.unwrap().len(), 1);
    }
}
