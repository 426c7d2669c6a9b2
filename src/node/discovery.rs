//! Discovery-set interactions: joining, listing, and leaving the
//! coordinator-side set of live peer bindings (spec.md §3, §4.3 steps 2-3).

use crate::coordinator::{CoordinatorClient, PeerBinding};
use crate::error::ClusterError;
use crate::state::Tag;

/// Announce this node's bindings to the fleet.
pub async fn announce(
    coordinator: &dyn CoordinatorClient,
    binding: &PeerBinding,
) -> Result<(), ClusterError> {
    coordinator
        .discovery_add(binding)
        .await
        .map_err(|source| ClusterError::TransientCoordinator {
            tag: Tag::new("cluster", "discovery"),
            source,
        })
}

/// Remove this node's bindings (shutdown, spec.md §4.8 step 2).
pub async fn withdraw(
    coordinator: &dyn CoordinatorClient,
    binding: &PeerBinding,
) -> Result<(), ClusterError> {
    coordinator
        .discovery_remove(binding)
        .await
        .map_err(|source| ClusterError::TransientCoordinator {
            tag: Tag::new("cluster", "discovery"),
            source,
        })
}

/// Every other known peer binding, excluding `self_binding`.
pub async fn peers_excluding(
    coordinator: &dyn CoordinatorClient,
    self_binding: &PeerBinding,
) -> Result<Vec<PeerBinding>, ClusterError> {
    let members = coordinator.discovery_members().await.map_err(|source| {
        ClusterError::TransientCoordinator {
            tag: Tag::new("cluster", "discovery"),
            source,
        }
    })?;

    Ok(members
        .into_iter()
        .filter(|binding| binding != self_binding)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::fake::InMemoryCoordinator;

    #[tokio::test]
    async fn peers_excluding_drops_self() {
        let coordinator = InMemoryCoordinator::new();
        let me = PeerBinding {
            pub_addr: "127.0.0.1:7511".to_string(),
            router_addr: "127.0.0.1:7510".to_string(),
        };
        let other = PeerBinding {
            pub_addr: "127.0.0.1:8511".to_string(),
            router_addr: "127.0.0.1:8510".to_string(),
        };

        announce(&coordinator, &me).await.unwrap();
        announce(&coordinator, &other).await.unwrap();

        let peers = peers_excluding(&coordinator, &me).await.unwrap();
        assert_eq!(peers, vec![other]);
    }

    #[tokio::test]
    async fn withdraw_removes_binding() {
        let coordinator = InMemoryCoordinator::new();
        let me = PeerBinding {
            pub_addr: "127.0.0.1:7511".to_string(),
            router_addr: "127.0.0.1:7510".to_string(),
        };

        announce(&coordinator, &me).await.unwrap();
        withdraw(&coordinator, &me).await.unwrap();

        assert!(coordinator.discovery_members().await.unwrap().is_empty());
    }
}
