//! Identity & dedup resolution.
//!
//! The classification is re-derived on every invocation because concurrent
//! deliveries race; the store's atomic upsert is the final authority and this
//! output is the advisory fast path.

use chrono::{DateTime, Utc};
use lira_core::{
    check_phone, CanonicalLeadInput, EngineResult, ExternalIdMatch, PhoneCheck, TenantSettings,
};
use lira_store::{LeadStore, Store};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupDecision {
    Create,
    Update(Uuid),
    SkipDuplicate(Uuid),
    RejectInvalid(PhoneCheck),
}

/// Classify an inbound lead: the phone sanity check runs first (a lead
/// without a usable contact number is rejected before storage, update or
/// not), then external identity, then the best-effort phone window for
/// sources without a stable external id.
pub async fn resolve(
    store: &dyn Store,
    input: &CanonicalLeadInput,
    settings: &TenantSettings,
    now: DateTime<Utc>,
) -> EngineResult<DedupDecision> {
    let normalized = input.normalized_phone();
    match check_phone(&normalized) {
        PhoneCheck::Ok => {}
        invalid => return Ok(DedupDecision::RejectInvalid(invalid)),
    }

    if let Some(external_id) = input.external_id.as_deref() {
        if let Some(existing) = store
            .find_by_external_id(input.company_id, &input.source, external_id)
            .await?
        {
            return Ok(match settings.duplicate_policy.on_external_id_match {
                ExternalIdMatch::Update => DedupDecision::Update(existing.id),
                ExternalIdMatch::Skip => DedupDecision::SkipDuplicate(existing.id),
            });
        }
        return Ok(DedupDecision::Create);
    }

    if let Some(existing) = store
        .find_recent_by_phone(
            input.company_id,
            &input.source,
            &normalized,
            &settings.duplicate_policy,
            now,
        )
        .await?
    {
        return Ok(DedupDecision::SkipDuplicate(existing.id));
    }

    Ok(DedupDecision::Create)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lira_store::{MemoryStore, UpsertOutcome};

    fn input(company: Uuid, source: &str, phone: &str) -> CanonicalLeadInput {
        let mut input = CanonicalLeadInput::empty(company, source);
        input.phone = phone.to_string();
        input
    }

    #[tokio::test]
    async fn missing_and_malformed_phones_are_rejected() {
        let store = MemoryStore::new();
        let company = Uuid::new_v4();
        let settings = TenantSettings::for_company(company);

        let missing = input(company, "web-form", "");
        assert_eq!(
            resolve(&store, &missing, &settings, Utc::now()).await.unwrap(),
            DedupDecision::RejectInvalid(PhoneCheck::Missing)
        );

        let short = input(company, "web-form", "12345");
        assert_eq!(
            resolve(&store, &short, &settings, Utc::now()).await.unwrap(),
            DedupDecision::RejectInvalid(PhoneCheck::BadLength)
        );
    }

    #[tokio::test]
    async fn known_external_id_classifies_per_policy() {
        let store = MemoryStore::new();
        let company = Uuid::new_v4();
        let mut settings = TenantSettings::for_company(company);

        let mut seed = input(company, "ad-form", "971501234567");
        seed.external_id = Some("ext-9".to_string());
        let created = store
            .upsert_lead(&seed, &settings, Utc::now())
            .await
            .unwrap();
        let UpsertOutcome::Created(lead) = created else {
            panic!();
        };

        assert_eq!(
            resolve(&store, &seed, &settings, Utc::now()).await.unwrap(),
            DedupDecision::Update(lead.id)
        );

        settings.duplicate_policy.on_external_id_match = ExternalIdMatch::Skip;
        assert_eq!(
            resolve(&store, &seed, &settings, Utc::now()).await.unwrap(),
            DedupDecision::SkipDuplicate(lead.id)
        );
    }

    #[tokio::test]
    async fn phone_window_flags_duplicates_for_external_id_less_sources() {
        let store = MemoryStore::new();
        let company = Uuid::new_v4();
        let settings = TenantSettings::for_company(company);

        let first = input(company, "web-form", "+971 50-123 4567");
        let outcome = store
            .upsert_lead(&first, &settings, Utc::now())
            .await
            .unwrap();

        // A different source submitting the same normalized phone is only a
        // duplicate under the cross-source scope.
        let same_phone_same_source = input(company, "web-form", "00971501234567");
        assert_eq!(
            resolve(&store, &same_phone_same_source, &settings, Utc::now())
                .await
                .unwrap(),
            DedupDecision::SkipDuplicate(outcome.lead_id())
        );

        let same_phone_other_source = input(company, "chat", "971501234567");
        assert_eq!(
            resolve(&store, &same_phone_other_source, &settings, Utc::now())
                .await
                .unwrap(),
            DedupDecision::Create
        );

        let mut cross = TenantSettings::for_company(company);
        cross.duplicate_policy.scope = lira_core::DuplicateScope::CrossSource;
        assert_eq!(
            resolve(&store, &same_phone_other_source, &cross, Utc::now())
                .await
                .unwrap(),
            DedupDecision::SkipDuplicate(outcome.lead_id())
        );
    }

    #[tokio::test]
    async fn fresh_identity_resolves_to_create() {
        let store = MemoryStore::new();
        let company = Uuid::new_v4();
        let settings = TenantSettings::for_company(company);

        let mut fresh = input(company, "ad-form", "971509998888");
        fresh.external_id = Some("never-seen".to_string());
        assert_eq!(
            resolve(&store, &fresh, &settings, Utc::now()).await.unwrap(),
            DedupDecision::Create
        );
    }
}
