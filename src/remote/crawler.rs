use super::{CancellationCheck, GraphBuilder, RemoteSession, ServiceRoot};
use crate::core::Result;
use crate::graph::ResourceGraph;
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};

const DEFAULT_CHECK_EVERY: usize = 8;

/// Breadth-first crawler over a session's hyperlinked resources.
///
/// Links pointing outside the fetched set are dropped so the graph never
/// references a resource it does not contain.
#[derive(Debug, Clone)]
pub struct CrawlingGraphBuilder {
    check_every: usize,
}

impl CrawlingGraphBuilder {
    pub fn new() -> Self {
        Self {
            check_every: DEFAULT_CHECK_EVERY,
        }
    }

    /// Calls the cancellation check after every `check_every` fetches.
    pub fn with_check_every(mut self, check_every: usize) -> Self {
        self.check_every = check_every.max(1);
        self
    }
}

impl Default for CrawlingGraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GraphBuilder for CrawlingGraphBuilder {
    async fn build(
        &self,
        session: &dyn RemoteSession,
        root: &ServiceRoot,
        check: &CancellationCheck<'_>,
    ) -> Result<ResourceGraph> {
        let mut graph = ResourceGraph::new(root.id);
        let mut pending_links = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = root.children.iter().cloned().collect();

        check()?;
        let mut fetched = 0usize;

        while let Some(uri) = queue.pop_front() {
            if !visited.insert(uri.clone()) {
                continue;
            }

            let document = session.get(&uri).await?;
            for link in document.links {
                if !visited.contains(&link.target_uri) {
                    queue.push_back(link.target_uri.clone());
                }
                pending_links.push(link);
            }
            graph.add_resource(document.resource);

            fetched += 1;
            if fetched % self.check_every == 0 {
                check()?;
            }
        }

        for link in pending_links {
            if graph.resource(&link.source_uri).is_some() && graph.resource(&link.target_uri).is_some() {
                graph.add_link(link);
            }
        }

        check()?;
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DiscoveryError, ServiceType};
    use crate::graph::{Resource, ResourceLink};
    use crate::remote::RemoteReader;
    use crate::remote::fixture::{FixtureRemote, FixtureServiceSpec};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    fn drawer(base_uri: &str, drives: usize) -> FixtureServiceSpec {
        let mut spec = FixtureServiceSpec::new(Uuid::new_v4(), ServiceType::PrimaryCompute, base_uri);
        spec.resources.push(Resource::new("/Chassis/1", "Chassis"));
        for index in 0..drives {
            let uri = format!("/Chassis/1/Drives/{index}");
            spec.resources.push(Resource::new(uri.clone(), "Drive"));
            spec.links.push(ResourceLink::new("/Chassis/1", uri, "drives"));
        }
        spec
    }

    #[tokio::test]
    async fn crawl_polls_borrowed_check_between_fetches() {
        let remote = FixtureRemote::new();
        remote.add_service(drawer("http://psme-1", 3));
        let session = remote.open("http://psme-1").await.unwrap();
        let root = session.root().await.unwrap();

        // The check borrows a local; it does not need to be 'static.
        let calls = AtomicUsize::new(0);
        let check = || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        };
        let graph = CrawlingGraphBuilder::new()
            .with_check_every(2)
            .build(session.as_ref(), &root, &check)
            .await
            .unwrap();

        assert_eq!(graph.resource_count(), 4);
        assert_eq!(graph.link_count(), 3);
        assert!(graph.has_link("/Chassis/1", "/Chassis/1/Drives/2", "drives"));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn crawl_stops_with_check_error() {
        let remote = FixtureRemote::new();
        remote.add_service(drawer("http://psme-1", 6));
        let session = remote.open("http://psme-1").await.unwrap();
        let root = session.root().await.unwrap();

        let budget = AtomicUsize::new(2);
        let check = || {
            if budget.fetch_sub(1, Ordering::SeqCst) == 0 {
                return Err(DiscoveryError::Canceled);
            }
            Ok(())
        };
        let err = CrawlingGraphBuilder::new()
            .with_check_every(1)
            .build(session.as_ref(), &root, &check)
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::Canceled));
    }
}
