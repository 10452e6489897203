//! The discovery gate.
//!
//! Resource kinds, custom ones especially, register asynchronously after
//! the API server comes up. Racing ahead to schema retrieval before they
//! are served would produce a document that simply lacks them, so the
//! pipeline blocks here until every desired kind shows up in discovery or
//! the budget runs out.

use std::cell::RefCell;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::APIResourceList;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::resources::{DesiredSet, GroupKind};
use crate::wait::{self, Attempt};

/// Where served resource kinds come from. Implemented for [`kube::Client`];
/// tests substitute a scripted fake.
#[async_trait]
pub trait DiscoverySource: Sync {
    /// Lists the preferred resources of every served group.
    async fn server_resources(&self) -> kube::Result<Vec<APIResourceList>>;
}

#[async_trait]
impl DiscoverySource for kube::Client {
    async fn server_resources(&self) -> kube::Result<Vec<APIResourceList>> {
        let mut lists = Vec::new();
        let groups = self.list_api_groups().await?;
        for group in groups.groups {
            let version = group
                .preferred_version
                .as_ref()
                .or_else(|| group.versions.first());
            let Some(version) = version else { continue };
            // a single stale or misbehaving group should not sink the poll
            match self.list_api_group_resources(&version.group_version).await {
                Ok(list) => lists.push(list),
                Err(err) => {
                    debug!(group = %group.name, error = %err, "skipping group that failed to list")
                }
            }
        }
        let core = self.list_core_api_versions().await?;
        if let Some(version) = core.versions.first() {
            lists.push(self.list_core_api_resources(version).await?);
        }
        Ok(lists)
    }
}

/// The API group of a `group/version` string; no slash means the legacy
/// core group.
fn group_of(group_version: &str) -> &str {
    match group_version.split_once('/') {
        Some((group, _version)) => group,
        None => "",
    }
}

/// Blocks until every key in `desired` has been observed among the served
/// resource kinds, marking found flags as it goes.
///
/// Poll cycles that fail to reach discovery are transient and retried.
/// Kinds the cluster serves but the caller never asked for are ignored. On
/// budget expiry the error names every key still missing.
pub async fn wait_for_resources<S: DiscoverySource>(
    source: &S,
    desired: &mut DesiredSet,
    interval: Duration,
    budget: Duration,
    token: &CancellationToken,
) -> Result<()> {
    let desired = RefCell::new(desired);
    let result = wait::poll_until(
        interval,
        budget,
        "desired resources to be served",
        token,
        || {
            let desired = &desired;
            async move {
                let lists = match source.server_resources().await {
                    Ok(lists) => lists,
                    Err(err) => {
                        warn!(error = %err, "discovery call failed, will retry");
                        return Ok(Attempt::NotYet);
                    }
                };
                let mut desired = desired.borrow_mut();
                for list in &lists {
                    let group = group_of(&list.group_version);
                    for resource in &list.resources {
                        let key = GroupKind {
                            group: group.to_string(),
                            kind: resource.kind.clone(),
                        };
                        if desired.mark_found(&key) {
                            info!(resource = %key, "desired resource is now served");
                        }
                    }
                }
                if desired.all_found() {
                    info!("all desired resources are served");
                    Ok(Attempt::Ready(()))
                } else {
                    debug!(missing = %desired.missing_display(), "still waiting for resources");
                    Ok(Attempt::NotYet)
                }
            }
        },
    )
    .await;
    match result {
        Err(Error::Timeout { budget, .. }) => Err(Error::Timeout {
            what: format!(
                "resources to be served: {}",
                desired.borrow().missing_display()
            ),
            budget,
        }),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::APIResource;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    enum Scripted {
        Lists(Vec<APIResourceList>),
        Failure,
    }

    #[derive(Default)]
    struct FakeSource {
        responses: Mutex<VecDeque<Scripted>>,
        polls: AtomicUsize,
    }

    #[async_trait]
    impl DiscoverySource for FakeSource {
        async fn server_resources(&self) -> kube::Result<Vec<APIResourceList>> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            match self.responses.lock().unwrap().pop_front() {
                Some(Scripted::Lists(lists)) => Ok(lists),
                Some(Scripted::Failure) => Err(kube::Error::Discovery(
                    kube::error::DiscoveryError::MissingApiGroup("scripted failure".to_string()),
                )),
                // keep answering the last known state: nothing served
                None => Ok(Vec::new()),
            }
        }
    }

    fn list(group_version: &str, kinds: &[&str]) -> APIResourceList {
        APIResourceList {
            group_version: group_version.to_string(),
            resources: kinds
                .iter()
                .map(|kind| APIResource {
                    kind: (*kind).to_string(),
                    name: kind.to_ascii_lowercase() + "s",
                    singular_name: kind.to_ascii_lowercase(),
                    namespaced: true,
                    verbs: vec!["get".to_string(), "list".to_string()],
                    ..Default::default()
                })
                .collect(),
        }
    }

    async fn desired(entries: &str) -> DesiredSet {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, entries.as_bytes()).unwrap();
        DesiredSet::parse(file.path().to_str().unwrap()).await.unwrap()
    }

    #[test]
    fn group_of_splits_off_the_version() {
        assert_eq!(group_of("apps/v1"), "apps");
        assert_eq!(group_of("management.cattle.io/v3"), "management.cattle.io");
        assert_eq!(group_of("v1"), "");
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_the_poll_that_serves_everything() {
        let source = FakeSource::default();
        source.responses.lock().unwrap().extend([
            Scripted::Lists(vec![]),
            Scripted::Lists(vec![list("v1", &["Pod"])]),
            Scripted::Lists(vec![list("v1", &["Pod"]), list("apps/v1", &["Deployment"])]),
        ]);
        let mut set = desired("Pod\nDeployment.apps\n").await;
        wait_for_resources(
            &source,
            &mut set,
            Duration::from_secs(10),
            Duration::from_secs(300),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(source.polls.load(Ordering::SeqCst), 3);
        assert!(set.all_found());
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_naming_the_missing_kind() {
        let source = FakeSource::default();
        source
            .responses
            .lock()
            .unwrap()
            .push_back(Scripted::Lists(vec![list("v1", &["Pod"])]));
        let mut set = desired("Pod\nWidget.example.com\n").await;
        let err = wait_for_resources(
            &source,
            &mut set,
            Duration::from_secs(10),
            Duration::from_secs(60),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        match err {
            Error::Timeout { what, budget } => {
                assert!(what.contains("Widget.example.com"), "{what}");
                assert!(!what.contains("Pod,"), "found kinds are not listed: {what}");
                assert_eq!(budget, Duration::from_secs(60));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_discovery_failures_are_retried() {
        let source = FakeSource::default();
        source.responses.lock().unwrap().extend([
            Scripted::Failure,
            Scripted::Lists(vec![list("v1", &["Pod"])]),
        ]);
        let mut set = desired("Pod\n").await;
        wait_for_resources(
            &source,
            &mut set,
            Duration::from_secs(10),
            Duration::from_secs(300),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(source.polls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn extra_served_kinds_are_ignored() {
        let source = FakeSource::default();
        source
            .responses
            .lock()
            .unwrap()
            .push_back(Scripted::Lists(vec![list(
                "v1",
                &["Pod", "Secret", "ConfigMap"],
            )]));
        let mut set = desired("Pod\n").await;
        wait_for_resources(
            &source,
            &mut set,
            Duration::from_secs(10),
            Duration::from_secs(300),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(set.len(), 1);
    }
}
