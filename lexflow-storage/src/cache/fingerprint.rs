//! Deterministic cache fingerprints
//!
//! The fingerprint covers exactly the enrichment-relevant parts of the query
//! context: intent tag, entity texts, concept tags, and jurisdiction. Entity
//! and concept lists are sorted and deduplicated before hashing so that
//! extraction order never changes the key.

use lexflow_core::{IntentTag, QueryContext};
use sha2::{Digest, Sha256};
use std::fmt;

/// A deterministic SHA-256 fingerprint used as a cache key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Fingerprint the enrichment input.
    pub fn for_enrichment(context: &QueryContext, jurisdiction: Option<&str>) -> Self {
        let mut entities: Vec<&str> = context
            .entities
            .iter()
            .map(|span| span.text.as_str())
            .collect();
        entities.sort_unstable();
        entities.dedup();

        let mut concepts: Vec<&str> = context.concepts.iter().map(String::as_str).collect();
        concepts.sort_unstable();
        concepts.dedup();

        Self::from_parts(context.intent, &entities, &concepts, jurisdiction)
    }

    fn from_parts(
        intent: IntentTag,
        entities: &[&str],
        concepts: &[&str],
        jurisdiction: Option<&str>,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"intent=");
        hasher.update(intent.as_db_str().as_bytes());
        hasher.update(b"\nentities=");
        for entity in entities {
            hasher.update(entity.as_bytes());
            hasher.update(b"\x1f");
        }
        hasher.update(b"\nconcepts=");
        for concept in concepts {
            hasher.update(concept.as_bytes());
            hasher.update(b"\x1f");
        }
        hasher.update(b"\njurisdiction=");
        hasher.update(jurisdiction.unwrap_or("").as_bytes());

        let result = hasher.finalize();
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&result);
        Self(hash)
    }

    /// Hex form used as the backend key.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Namespaced key for shared backends.
    pub fn storage_key(&self) -> String {
        format!("lexflow:enrich:{}", self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({}..)", &self.to_hex()[..12])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lexflow_core::{EntityKind, EntitySpan};

    fn span(text: &str, start: usize) -> EntitySpan {
        EntitySpan {
            text: text.to_string(),
            kind: EntityKind::NormReference,
            start,
            end: start + text.len(),
            confidence: 0.9,
        }
    }

    fn context(entities: Vec<EntitySpan>, concepts: Vec<&str>) -> QueryContext {
        QueryContext {
            intent: IntentTag::NormSearch,
            intent_confidence: 0.9,
            complexity: 0.1,
            entities,
            concepts: concepts.into_iter().map(String::from).collect(),
            norm_references: Vec::new(),
            temporal_hints: Vec::new(),
        }
    }

    #[test]
    fn test_fingerprint_stable() {
        let ctx = context(vec![span("art. 1321 c.c.", 0)], vec!["contratto"]);
        let a = Fingerprint::for_enrichment(&ctx, Some("IT"));
        let b = Fingerprint::for_enrichment(&ctx, Some("IT"));
        assert_eq!(a, b);
    }

    #[test]
    fn test_fingerprint_order_independent() {
        let forwards = context(
            vec![span("art. 1321 c.c.", 0), span("art. 1322 c.c.", 20)],
            vec!["contratto", "autonomia"],
        );
        let backwards = context(
            vec![span("art. 1322 c.c.", 0), span("art. 1321 c.c.", 20)],
            vec!["autonomia", "contratto"],
        );
        assert_eq!(
            Fingerprint::for_enrichment(&forwards, None),
            Fingerprint::for_enrichment(&backwards, None)
        );
    }

    #[test]
    fn test_fingerprint_sensitive_to_intent() {
        let ctx_a = context(vec![span("art. 1321 c.c.", 0)], vec![]);
        let mut ctx_b = ctx_a.clone();
        ctx_b.intent = IntentTag::Interpretation;
        assert_ne!(
            Fingerprint::for_enrichment(&ctx_a, None),
            Fingerprint::for_enrichment(&ctx_b, None)
        );
    }

    #[test]
    fn test_fingerprint_sensitive_to_jurisdiction() {
        let ctx = context(vec![span("art. 1321 c.c.", 0)], vec![]);
        assert_ne!(
            Fingerprint::for_enrichment(&ctx, Some("IT")),
            Fingerprint::for_enrichment(&ctx, Some("EU"))
        );
    }

    #[test]
    fn test_storage_key_namespaced() {
        let ctx = context(vec![], vec![]);
        let key = Fingerprint::for_enrichment(&ctx, None).storage_key();
        assert!(key.starts_with("lexflow:enrich:"));
        assert_eq!(key.len(), "lexflow:enrich:".len() + 64);
    }
}
