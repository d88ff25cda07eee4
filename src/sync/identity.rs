use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::app::CredentialConfig;
use crate::error::Result;
use crate::providers::{RawUsageEvent, UsageProvider};
use crate::storage::identity::IdentityMapping;
use crate::sync::{AttributedEvent, SyncEngine};

/// Result of one mapping refresh.
#[derive(Debug, Clone, Default)]
pub struct MappingRefreshOutcome {
    pub mapped: usize,
    pub unresolved: usize,
}

impl SyncEngine {
    /// Attach the stored identity mapping to each raw event. Unmapped ids
    /// stay unattributed (`None`), which is distinct from any identity.
    pub(crate) async fn attribute_events(
        &self,
        tool: &str,
        events: Vec<RawUsageEvent>,
    ) -> Result<Vec<AttributedEvent>> {
        let mut cache: HashMap<String, Option<String>> = HashMap::new();
        let mut attributed = Vec::with_capacity(events.len());

        for event in events {
            let identity = match &event.external_id {
                Some(id) => match cache.get(id) {
                    Some(cached) => cached.clone(),
                    None => {
                        let resolved = self.identities.resolve(tool, id).await?;
                        cache.insert(id.clone(), resolved.clone());
                        resolved
                    }
                },
                None => None,
            };
            attributed.push(AttributedEvent { event, identity });
        }

        Ok(attributed)
    }

    /// Refresh identity mappings for a provider, then retroactively rewrite
    /// the usage rows the new mappings attribute.
    ///
    /// Strategy is chosen by volume: a handful of unmapped ids are looked up
    /// individually across every configured credential (multi-org safe,
    /// since nothing records which org owns which key); more than that and
    /// relisting the whole org is cheaper than per-id lookups.
    pub async fn refresh_identity_mappings(
        &self,
        provider: &dyn UsageProvider,
        credentials: &[CredentialConfig],
    ) -> Result<MappingRefreshOutcome> {
        let tool = provider.tool();
        let unmapped = self.identities.unmapped_ids(tool).await?;
        if unmapped.is_empty() {
            debug!("No unmapped ids for {}", tool);
            return Ok(MappingRefreshOutcome::default());
        }

        info!("{} has {} unmapped ids", tool, unmapped.len());

        let resolved = if unmapped.len() <= self.config.incremental_resync_max_ids {
            self.incremental_resync(provider, credentials, &unmapped)
                .await?
        } else {
            self.full_resync(provider, credentials, &unmapped).await?
        };

        let outcome = MappingRefreshOutcome {
            mapped: resolved.len(),
            unresolved: unmapped.len() - resolved.len(),
        };

        for mapping in &resolved {
            self.usage
                .reattribute(&mapping.tool, &mapping.external_id, &mapping.identity)
                .await?;
        }

        if outcome.unresolved > 0 {
            // Keys owned by orgs outside our credentials stay unattributed
            warn!("{} ids for {} stayed unresolved", outcome.unresolved, tool);
        }
        info!("Mapped {} new identities for {}", outcome.mapped, tool);

        Ok(outcome)
    }

    /// Manual fix-up: write one mapping and rewrite matching historical
    /// rows, not just future ones.
    pub async fn set_identity_mapping(
        &self,
        tool: &str,
        external_id: &str,
        identity: &str,
    ) -> Result<u64> {
        self.identities.set_mapping(tool, external_id, identity).await?;
        self.usage.reattribute(tool, external_id, identity).await
    }

    /// Drop a mapping. Rows already attributed through it keep their
    /// identity; only future resolution is affected. Returns whether a
    /// mapping existed.
    pub async fn remove_identity_mapping(&self, tool: &str, external_id: &str) -> Result<bool> {
        self.identities.delete_mapping(tool, external_id).await
    }

    /// Relist every org's members and keys, cross-reference by creator id,
    /// and bulk-write mappings for the ids we were missing.
    async fn full_resync(
        &self,
        provider: &dyn UsageProvider,
        credentials: &[CredentialConfig],
        unmapped: &[String],
    ) -> Result<Vec<IdentityMapping>> {
        let tool = provider.tool();
        let mut resolved = Vec::new();

        for credential in credentials {
            let members = provider.list_members(credential).await?;
            let email_by_member: HashMap<&str, &str> = members
                .iter()
                .map(|m| (m.id.as_str(), m.email.as_str()))
                .collect();

            for key in provider.list_api_keys(credential).await? {
                if !unmapped.contains(&key.id) {
                    continue;
                }
                let Some(creator) = key.creator_id.as_deref() else {
                    continue;
                };
                if let Some(email) = email_by_member.get(creator) {
                    resolved.push(IdentityMapping {
                        tool: tool.to_string(),
                        external_id: key.id,
                        identity: (*email).to_string(),
                    });
                }
            }
        }

        self.identities.set_mappings(&resolved).await?;
        Ok(resolved)
    }

    /// Look each unmapped id up individually, trying every credential until
    /// one org recognizes it. Member directories are listed lazily, once
    /// per org.
    async fn incremental_resync(
        &self,
        provider: &dyn UsageProvider,
        credentials: &[CredentialConfig],
        unmapped: &[String],
    ) -> Result<Vec<IdentityMapping>> {
        let tool = provider.tool();
        let mut member_dirs: HashMap<usize, HashMap<String, String>> = HashMap::new();
        let mut resolved = Vec::new();

        for id in unmapped {
            for (idx, credential) in credentials.iter().enumerate() {
                let Some(key) = provider.lookup_api_key(credential, id).await? else {
                    continue;
                };
                let Some(creator) = key.creator_id else {
                    break;
                };

                if !member_dirs.contains_key(&idx) {
                    let members = provider.list_members(credential).await?;
                    member_dirs.insert(
                        idx,
                        members.into_iter().map(|m| (m.id, m.email)).collect(),
                    );
                }

                if let Some(email) = member_dirs[&idx].get(&creator) {
                    resolved.push(IdentityMapping {
                        tool: tool.to_string(),
                        external_id: id.clone(),
                        identity: email.clone(),
                    });
                }
                break;
            }
        }

        self.identities.set_mappings(&resolved).await?;
        Ok(resolved)
    }
}
