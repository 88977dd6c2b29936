//! Dispatch Policy
//!
//! Decides which specialists to invoke for a session.
//! The policy is data: a table of lexical signal groups per specialist kind.
//! A kind is selected when any of its groups matches the session text.
//! Transaction-pattern analysis is the baseline and is always selected.

use crate::memory::PatternRecord;
use crate::models::SpecialistKind;
use lazy_static::lazy_static;
use std::collections::BTreeSet;

/// Named set of terms; matches if any term occurs in the text
#[derive(Debug, Clone)]
pub struct SignalGroup {
    pub name: &'static str,
    pub terms: &'static [&'static str],
}

impl SignalGroup {
    pub fn matches(&self, text: &str) -> bool {
        self.terms.iter().any(|term| text.contains(term))
    }
}

#[derive(Debug, Clone)]
pub struct SignalTable {
    entries: Vec<(SpecialistKind, Vec<SignalGroup>)>,
}

impl SignalTable {
    pub fn new(entries: Vec<(SpecialistKind, Vec<SignalGroup>)>) -> Self {
        Self { entries }
    }

    pub fn groups_for(&self, kind: SpecialistKind) -> &[SignalGroup] {
        self.entries
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, groups)| groups.as_slice())
            .unwrap_or(&[])
    }
}

/// Baseline selection, present in every decision
pub const BASELINE_KINDS: &[SpecialistKind] = &[SpecialistKind::TransactionPattern];

lazy_static! {
    static ref DEFAULT_SIGNALS: SignalTable = SignalTable::new(vec![
        (
            SpecialistKind::EntityResearch,
            vec![
                SignalGroup {
                    name: "ownership",
                    terms: &["beneficial owner", "beneficiary", "ubo", "nominee", "ownership"],
                },
                SignalGroup {
                    name: "legal-entity",
                    terms: &["shell", "company", "entity", "corporation", "director", "trust"],
                },
                SignalGroup {
                    name: "screening",
                    terms: &["sanction", "pep", "adverse media", "politically exposed"],
                },
            ],
        ),
        (
            SpecialistKind::GeographicRouting,
            vec![
                SignalGroup {
                    name: "jurisdiction",
                    terms: &["jurisdiction", "offshore", "cross-border", "high-risk country", "tax haven"],
                },
                SignalGroup {
                    name: "routing",
                    terms: &["wire", "transfer", "routing", "correspondent", "remit"],
                },
                SignalGroup {
                    name: "secrecy-havens",
                    terms: &["cayman", "cyprus", "bermuda", "panama", "bvi"],
                },
            ],
        ),
        (
            SpecialistKind::TransactionPattern,
            vec![
                SignalGroup {
                    name: "threshold",
                    terms: &["threshold", "structur", "$10,000", "10,000", "just under"],
                },
                SignalGroup {
                    name: "frequency",
                    terms: &["multiple", "frequent", "rapid", "velocity", "pattern"],
                },
                SignalGroup {
                    name: "cash",
                    terms: &["cash", "deposit"],
                },
            ],
        ),
        (
            SpecialistKind::ChainTracing,
            vec![
                SignalGroup {
                    name: "address",
                    terms: &["wallet", "0x", "bc1", "address"],
                },
                SignalGroup {
                    name: "ledger",
                    terms: &[
                        "blockchain", "on-chain", "ledger", "bitcoin", "ethereum", "crypto",
                        "mixer", "tumbler", "usdt",
                    ],
                },
            ],
        ),
    ]);
}

/// Dispatch policy engine
#[derive(Debug, Clone)]
pub struct DispatchPolicy {
    table: SignalTable,
}

impl DispatchPolicy {
    pub fn new(table: SignalTable) -> Self {
        Self { table }
    }

    /// Pure, deterministic selection over the signal table
    pub fn decide(&self, session_text: &str) -> BTreeSet<SpecialistKind> {
        let text = session_text.to_lowercase();

        let mut selected: BTreeSet<SpecialistKind> = self
            .table
            .entries
            .iter()
            .filter(|(_, groups)| groups.iter().any(|g| g.matches(&text)))
            .map(|(kind, _)| *kind)
            .collect();

        selected.extend(BASELINE_KINDS.iter().copied());
        selected
    }

    /// Names of the groups that fired, per kind (for tracing and the API)
    pub fn explain(&self, session_text: &str) -> Vec<(SpecialistKind, Vec<&'static str>)> {
        let text = session_text.to_lowercase();

        self.table
            .entries
            .iter()
            .filter_map(|(kind, groups)| {
                let fired: Vec<&'static str> = groups
                    .iter()
                    .filter(|g| g.matches(&text))
                    .map(|g| g.name)
                    .collect();
                (!fired.is_empty()).then_some((*kind, fired))
            })
            .collect()
    }

    /// Terms of one kind's groups that occur in the text, in table order
    pub fn matched_terms(&self, kind: SpecialistKind, session_text: &str) -> Vec<&'static str> {
        let text = session_text.to_lowercase();

        self.table
            .groups_for(kind)
            .iter()
            .flat_map(|g| g.terms.iter().copied())
            .filter(|term| text.contains(term))
            .collect()
    }

    /// Kinds implied by previously confirmed patterns
    pub fn kinds_for_patterns(
        records: &[PatternRecord],
        min_confidence: f64,
    ) -> BTreeSet<SpecialistKind> {
        records
            .iter()
            .filter(|r| r.metadata.confidence >= min_confidence)
            .filter_map(|r| r.metadata.kind)
            .collect()
    }
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_SIGNALS.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::PatternMetadata;

    fn kinds(list: &[SpecialistKind]) -> BTreeSet<SpecialistKind> {
        list.iter().copied().collect()
    }

    #[test]
    fn test_jurisdiction_and_wallet_terms() {
        let policy = DispatchPolicy::default();
        let selected = policy.decide(
            "funds moved through an offshore jurisdiction and landed in wallet 0x9f2c",
        );

        assert_eq!(
            selected,
            kinds(&[
                SpecialistKind::GeographicRouting,
                SpecialistKind::TransactionPattern,
                SpecialistKind::ChainTracing,
            ])
        );
    }

    #[test]
    fn test_no_signal_falls_back_to_baseline() {
        let policy = DispatchPolicy::default();
        assert_eq!(
            policy.decide("customer called the branch"),
            kinds(&[SpecialistKind::TransactionPattern])
        );
        assert_eq!(policy.decide(""), kinds(&[SpecialistKind::TransactionPattern]));
    }

    #[test]
    fn test_decision_is_deterministic() {
        let policy = DispatchPolicy::default();
        let text = "Shell company with nominee director sends wire to Cyprus";
        let first = policy.decide(text);

        for _ in 0..50 {
            assert_eq!(policy.decide(text), first);
        }
        assert_eq!(DispatchPolicy::default().decide(text), first);
        assert!(first.contains(&SpecialistKind::EntityResearch));
        assert!(first.contains(&SpecialistKind::GeographicRouting));
    }

    #[test]
    fn test_matching_is_case_insensitive() {
        let policy = DispatchPolicy::default();
        assert!(policy
            .decide("BITCOIN MIXER")
            .contains(&SpecialistKind::ChainTracing));
    }

    #[test]
    fn test_explain_names_fired_groups() {
        let policy = DispatchPolicy::default();
        let explained = policy.explain("cash deposits just under the threshold");
        let (_, groups) = explained
            .iter()
            .find(|(k, _)| *k == SpecialistKind::TransactionPattern)
            .unwrap();
        assert!(groups.contains(&"threshold"));
        assert!(groups.contains(&"cash"));
    }

    #[test]
    fn test_matched_terms_per_kind() {
        let policy = DispatchPolicy::default();
        let terms = policy.matched_terms(SpecialistKind::GeographicRouting, "Wire to CAYMAN");
        assert_eq!(terms, vec!["wire", "cayman"]);
        assert!(policy
            .matched_terms(SpecialistKind::ChainTracing, "Wire to CAYMAN")
            .is_empty());
    }

    #[test]
    fn test_custom_table() {
        let policy = DispatchPolicy::new(SignalTable::new(vec![(
            SpecialistKind::ChainTracing,
            vec![SignalGroup { name: "xmr", terms: &["monero"] }],
        )]));
        assert!(policy.decide("monero").contains(&SpecialistKind::ChainTracing));
        assert!(policy.decide("wallet").len() == 1);
    }

    #[test]
    fn test_kinds_for_patterns_respects_confidence() {
        let mut strong = PatternMetadata::confirmed(Some(SpecialistKind::GeographicRouting));
        strong.confidence = 0.9;
        let mut weak = PatternMetadata::confirmed(Some(SpecialistKind::ChainTracing));
        weak.confidence = 0.3;

        let records = vec![
            PatternRecord {
                key: "pattern:geographic-routing:a".into(),
                value: serde_json::json!({}),
                metadata: strong,
            },
            PatternRecord {
                key: "pattern:chain-tracing:b".into(),
                value: serde_json::json!({}),
                metadata: weak,
            },
        ];

        assert_eq!(
            DispatchPolicy::kinds_for_patterns(&records, 0.7),
            kinds(&[SpecialistKind::GeographicRouting])
        );
    }
}
