//! Specialist trait and registry
//!
//! A specialist analyses one facet of a session and reports findings plus a
//! 0-100 sub-score. Rule-based analyzers run in-process; HTTP-backed ones call
//! a remote analysis service.

use crate::error::InvestigationError;
use crate::models::{SpecialistContext, SpecialistKind, SpecialistReport};
use crate::Result;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One specialist analyzer per kind
#[async_trait::async_trait]
pub trait Specialist: Send + Sync {
    fn kind(&self) -> SpecialistKind;

    /// Whether findings of other succeeded tasks should be passed in
    fn accepts_cross_task_context(&self) -> bool {
        false
    }

    /// Must return promptly once `cancel` fires
    async fn run(&self, context: &SpecialistContext, cancel: CancellationToken) -> Result<SpecialistReport>;
}

/// Specialist registry keyed by kind
pub struct SpecialistRegistry {
    specialists: HashMap<SpecialistKind, Arc<dyn Specialist>>,
}

impl SpecialistRegistry {
    pub fn new() -> Self {
        Self {
            specialists: HashMap::new(),
        }
    }

    /// Registering a kind twice replaces the earlier specialist
    pub fn register(&mut self, specialist: Arc<dyn Specialist>) {
        self.specialists.insert(specialist.kind(), specialist);
    }

    pub fn get(&self, kind: SpecialistKind) -> Option<Arc<dyn Specialist>> {
        self.specialists.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<SpecialistKind> {
        let mut kinds: Vec<SpecialistKind> = self.specialists.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

impl Default for SpecialistRegistry {
    fn default() -> Self {
        Self::new()
    }
}

//
// ================= Rule-based analyzers =================
//

enum Matcher {
    Terms(&'static [&'static str]),
    /// Any dollar amount in the text within the inclusive range
    AmountRange(f64, f64),
}

struct Indicator {
    matcher: Matcher,
    finding: &'static str,
    score: f64,
}

impl Indicator {
    const fn terms(terms: &'static [&'static str], finding: &'static str, score: f64) -> Self {
        Self {
            matcher: Matcher::Terms(terms),
            finding,
            score,
        }
    }

    fn matches(&self, text: &str, amounts: &[f64]) -> bool {
        match &self.matcher {
            Matcher::Terms(terms) => terms.iter().any(|t| text.contains(t)),
            Matcher::AmountRange(low, high) => amounts.iter().any(|a| a >= low && a <= high),
        }
    }
}

/// Score bump for every indicator beyond the strongest one
const CORROBORATION_BONUS: f64 = 5.0;
const BASELINE_SCORE: f64 = 10.0;

/// Deterministic keyword analyzer over the session text
pub struct RuleBasedSpecialist {
    kind: SpecialistKind,
    indicators: Vec<Indicator>,
    clean_finding: &'static str,
    cross_task: bool,
}

impl RuleBasedSpecialist {
    pub fn entity_research() -> Self {
        Self {
            kind: SpecialistKind::EntityResearch,
            indicators: vec![
                Indicator::terms(&["shell", "nominee"], "Entity exhibits shell company characteristics", 85.0),
                Indicator::terms(
                    &["layers of corporate", "layered ownership"],
                    "Layered corporate structure obscures beneficial ownership",
                    80.0,
                ),
                Indicator::terms(
                    &["limited or suspicious documentation", "suspicious or altered", "no supporting documentation"],
                    "Limited documentation raises compliance concerns",
                    65.0,
                ),
                Indicator::terms(&["offshore"], "Offshore jurisdiction increases risk profile", 60.0),
                Indicator::terms(
                    &["relationship unclear", "one-time transaction with new entity"],
                    "Counterparty relationship is unclear",
                    55.0,
                ),
            ],
            clean_finding: "Entity research completed - no immediate red flags",
            cross_task: false,
        }
    }

    pub fn geographic_routing() -> Self {
        Self {
            kind: SpecialistKind::GeographicRouting,
            indicators: vec![
                Indicator::terms(
                    &["high-risk", "high risk", "iran", "north korea", "myanmar", "afghanistan"],
                    "High-risk jurisdiction routing detected",
                    90.0,
                ),
                Indicator::terms(
                    &["cayman", "cyprus", "bermuda", "panama", "bvi", "offshore"],
                    "Offshore layering route detected",
                    85.0,
                ),
                Indicator::terms(&["secrecy"], "Destination offers banking secrecy", 75.0),
                Indicator::terms(
                    &["multiple jurisdictions", "multi-jurisdiction", "routed through"],
                    "Complex multi-jurisdictional routing identified",
                    70.0,
                ),
            ],
            clean_finding: "Geographic analysis completed - standard routing",
            cross_task: false,
        }
    }

    pub fn transaction_pattern() -> Self {
        Self {
            kind: SpecialistKind::TransactionPattern,
            indicators: vec![
                Indicator {
                    matcher: Matcher::AmountRange(9000.0, 9999.99),
                    finding: "Structuring behavior detected - amounts avoid reporting thresholds",
                    score: 95.0,
                },
                Indicator::terms(
                    &["under $10,000", "just under", "multiple deposits", "structur"],
                    "Deposits split to stay below the reporting threshold",
                    90.0,
                ),
                Indicator::terms(
                    &["multiple branches", "branches/accounts", "across accounts"],
                    "Activity spread across branches or accounts",
                    75.0,
                ),
                Indicator::terms(
                    &["significantly higher"],
                    "Unusual transaction size compared to customer profile",
                    70.0,
                ),
                Indicator::terms(
                    &["vague or inconsistent", "inconsistent explanation"],
                    "Source of funds explanation is inconsistent",
                    65.0,
                ),
            ],
            clean_finding: "Pattern analysis completed - no significant anomalies",
            cross_task: false,
        }
    }

    pub fn chain_tracing() -> Self {
        Self {
            kind: SpecialistKind::ChainTracing,
            indicators: vec![
                Indicator::terms(&["mixer", "tumbler", "tornado"], "Funds passed through a mixing service", 95.0),
                Indicator::terms(&["monero", "zcash", "privacy coin"], "Privacy coin usage obscures fund flows", 85.0),
                Indicator::terms(
                    &["peel chain", "chain hopping", "bridge"],
                    "Rapid cross-chain hops observed",
                    75.0,
                ),
                Indicator::terms(&["wallet", "0x", "bc1"], "On-chain wallet activity linked to the case", 60.0),
                // other kinds' findings reach chain tracing only when it is
                // dispatched after they succeeded, i.e. on a later dispatch
                Indicator::terms(
                    &["offshore layering", "shell company"],
                    "Off-chain layering corroborates on-chain exposure",
                    50.0,
                ),
            ],
            clean_finding: "Chain tracing completed - no on-chain exposure found",
            cross_task: true,
        }
    }

    /// Findings and score for a lowercased text
    fn evaluate(&self, text: &str) -> SpecialistReport {
        let amounts = dollar_amounts(text);

        let matched: Vec<&Indicator> = self
            .indicators
            .iter()
            .filter(|i| i.matches(text, &amounts))
            .collect();

        if matched.is_empty() {
            return SpecialistReport {
                findings: vec![self.clean_finding.to_string()],
                risk_score: BASELINE_SCORE,
            };
        }

        let strongest = matched.iter().map(|i| i.score).fold(0.0, f64::max);
        let bonus = CORROBORATION_BONUS * (matched.len() - 1) as f64;

        SpecialistReport {
            findings: matched.iter().map(|i| i.finding.to_string()).collect(),
            risk_score: (strongest + bonus).min(100.0),
        }
    }
}

#[async_trait::async_trait]
impl Specialist for RuleBasedSpecialist {
    fn kind(&self) -> SpecialistKind {
        self.kind
    }

    fn accepts_cross_task_context(&self) -> bool {
        self.cross_task
    }

    async fn run(&self, context: &SpecialistContext, cancel: CancellationToken) -> Result<SpecialistReport> {
        if cancel.is_cancelled() {
            return Err(InvestigationError::CollaboratorError(format!(
                "{} cancelled before start",
                self.kind
            )));
        }

        let mut text = context.session_text.to_lowercase();
        if self.cross_task {
            for prior in &context.prior_findings {
                for finding in &prior.findings {
                    text.push('\n');
                    text.push_str(&finding.to_lowercase());
                }
            }
        }

        let mut report = self.evaluate(&text);

        for hint in context
            .pattern_hints
            .iter()
            .filter(|h| h.split(':').any(|seg| seg == self.kind.as_str()))
        {
            report
                .findings
                .push(format!("Matches previously confirmed pattern {}", hint));
        }

        debug!(
            kind = %self.kind,
            score = report.risk_score,
            findings = report.findings.len(),
            "Rule-based analysis finished"
        );

        Ok(report)
    }
}

/// Dollar-like amounts in free text: `$9,500`, `9950`, `9500.00`
fn dollar_amounts(text: &str) -> Vec<f64> {
    text.split_whitespace()
        .filter_map(|token| {
            let cleaned: String = token
                .trim_start_matches('$')
                .trim_end_matches(|c: char| !c.is_ascii_digit())
                .chars()
                .filter(|c| *c != ',')
                .collect();
            if cleaned.is_empty() || !cleaned.starts_with(|c: char| c.is_ascii_digit()) {
                return None;
            }
            cleaned.parse::<f64>().ok()
        })
        .collect()
}

//
// ================= HTTP-backed analyzer =================
//

/// Remote analyzer: `POST {base}/specialists/{kind}` with the context as body
pub struct HttpSpecialist {
    kind: SpecialistKind,
    client: Client,
    base_url: String,
}

impl HttpSpecialist {
    pub fn new(kind: SpecialistKind, base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self::with_client(kind, base_url, client))
    }

    pub fn with_client(kind: SpecialistKind, base_url: &str, client: Client) -> Self {
        Self {
            kind,
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}/specialists/{}", self.base_url, self.kind.as_str())
    }

    async fn post_context(&self, context: &SpecialistContext) -> Result<SpecialistReport> {
        let url = self.endpoint();

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(context)
            .send()
            .await
            .map_err(|e| {
                InvestigationError::CollaboratorError(format!(
                    "Specialist request failed for {}: {}",
                    self.kind, e
                ))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InvestigationError::CollaboratorError(format!(
                "Specialist service returned {} for {}: {}",
                status, self.kind, body
            )));
        }

        response.json::<SpecialistReport>().await.map_err(|e| {
            InvestigationError::CollaboratorError(format!(
                "Invalid report from {} specialist: {}",
                self.kind, e
            ))
        })
    }
}

#[async_trait::async_trait]
impl Specialist for HttpSpecialist {
    fn kind(&self) -> SpecialistKind {
        self.kind
    }

    fn accepts_cross_task_context(&self) -> bool {
        true
    }

    async fn run(&self, context: &SpecialistContext, cancel: CancellationToken) -> Result<SpecialistReport> {
        tokio::select! {
            _ = cancel.cancelled() => {
                warn!(kind = %self.kind, "Remote specialist call abandoned on cancellation");
                Err(InvestigationError::CollaboratorError(format!("{} cancelled", self.kind)))
            }
            report = self.post_context(context) => report,
        }
    }
}

/// Rule-based analyzers for every kind
pub fn create_default_registry() -> SpecialistRegistry {
    let mut registry = SpecialistRegistry::new();
    registry.register(Arc::new(RuleBasedSpecialist::entity_research()));
    registry.register(Arc::new(RuleBasedSpecialist::geographic_routing()));
    registry.register(Arc::new(RuleBasedSpecialist::transaction_pattern()));
    registry.register(Arc::new(RuleBasedSpecialist::chain_tracing()));
    registry
}

/// HTTP analyzers for every kind sharing one connection pool
pub fn create_http_registry(base_url: &str) -> Result<SpecialistRegistry> {
    let client = Client::builder()
        .pool_idle_timeout(Duration::from_secs(60))
        .pool_max_idle_per_host(8)
        .timeout(Duration::from_secs(30))
        .build()?;

    let mut registry = SpecialistRegistry::new();
    for kind in SpecialistKind::ALL {
        registry.register(Arc::new(HttpSpecialist::with_client(kind, base_url, client.clone())));
    }
    Ok(registry)
}

//
// ================= Scripted specialists (tests) =================
//

#[cfg(test)]
pub(crate) mod scripted {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    pub enum Step {
        Score(f64),
        Fail,
        /// Never finishes on its own; honours cancellation
        Hang,
        /// Never finishes and ignores cancellation
        Stubborn,
    }

    /// Replays a fixed script, repeating the last step once exhausted
    pub struct ScriptedSpecialist {
        kind: SpecialistKind,
        steps: Mutex<VecDeque<Step>>,
        last: Mutex<Step>,
        cross_task: bool,
        pub calls: AtomicU32,
        pub contexts: Mutex<Vec<SpecialistContext>>,
    }

    impl ScriptedSpecialist {
        pub fn new(kind: SpecialistKind, steps: Vec<Step>) -> Self {
            let last = steps.last().cloned().unwrap_or(Step::Score(0.0));
            Self {
                kind,
                steps: Mutex::new(steps.into()),
                last: Mutex::new(last),
                cross_task: false,
                calls: AtomicU32::new(0),
                contexts: Mutex::new(Vec::new()),
            }
        }

        pub fn scoring(kind: SpecialistKind, score: f64) -> Self {
            Self::new(kind, vec![Step::Score(score)])
        }

        pub fn with_cross_task(mut self) -> Self {
            self.cross_task = true;
            self
        }

        pub fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Specialist for ScriptedSpecialist {
        fn kind(&self) -> SpecialistKind {
            self.kind
        }

        fn accepts_cross_task_context(&self) -> bool {
            self.cross_task
        }

        async fn run(&self, context: &SpecialistContext, cancel: CancellationToken) -> Result<SpecialistReport> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.contexts.lock().unwrap().push(context.clone());

            let step = {
                let mut steps = self.steps.lock().unwrap();
                match steps.pop_front() {
                    Some(step) => step,
                    None => self.last.lock().unwrap().clone(),
                }
            };

            match step {
                Step::Score(score) => Ok(SpecialistReport {
                    findings: vec![format!("{} finding", self.kind)],
                    risk_score: score,
                }),
                Step::Fail => Err(InvestigationError::CollaboratorError(format!(
                    "{} upstream unavailable",
                    self.kind
                ))),
                Step::Hang => {
                    cancel.cancelled().await;
                    Err(InvestigationError::CollaboratorError("cancelled".into()))
                }
                Step::Stubborn => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PriorFinding;
    use uuid::Uuid;

    fn context(kind: SpecialistKind, text: &str) -> SpecialistContext {
        SpecialistContext {
            session_id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            kind,
            initial_query: text.to_string(),
            session_text: text.to_lowercase(),
            answers: vec![],
            prior_findings: vec![],
            pattern_hints: vec![],
        }
    }

    #[test]
    fn test_dollar_amounts() {
        assert_eq!(dollar_amounts("deposits of $9,500 and 9950."), vec![9500.0, 9950.0]);
        assert!(dollar_amounts("no numbers here").is_empty());
        assert!(dollar_amounts("wallet 0x12ab").is_empty());
    }

    #[tokio::test]
    async fn test_structuring_amounts_score_high() {
        let specialist = RuleBasedSpecialist::transaction_pattern();
        let ctx = context(SpecialistKind::TransactionPattern, "Three cash deposits of $9,900 each");

        let report = specialist.run(&ctx, CancellationToken::new()).await.unwrap();
        assert_eq!(report.risk_score, 95.0);
        assert!(report.findings[0].contains("Structuring"));
    }

    #[tokio::test]
    async fn test_clean_text_gets_baseline() {
        let specialist = RuleBasedSpecialist::entity_research();
        let ctx = context(SpecialistKind::EntityResearch, "Salary payment from employer");

        let report = specialist.run(&ctx, CancellationToken::new()).await.unwrap();
        assert_eq!(report.risk_score, BASELINE_SCORE);
        assert_eq!(report.findings.len(), 1);
    }

    #[tokio::test]
    async fn test_corroborating_indicators_add_up() {
        let specialist = RuleBasedSpecialist::geographic_routing();
        let ctx = context(
            SpecialistKind::GeographicRouting,
            "Wire to a high-risk offshore bank in Cayman with banking secrecy",
        );

        let report = specialist.run(&ctx, CancellationToken::new()).await.unwrap();
        // 90 strongest + 2 corroborating indicators
        assert_eq!(report.risk_score, 100.0);
        assert_eq!(report.findings.len(), 3);
    }

    #[tokio::test]
    async fn test_chain_tracing_reads_prior_findings() {
        let specialist = RuleBasedSpecialist::chain_tracing();
        assert!(specialist.accepts_cross_task_context());

        let mut ctx = context(SpecialistKind::ChainTracing, "Payment from wallet bc1qxyz");
        let alone = specialist.run(&ctx, CancellationToken::new()).await.unwrap();

        ctx.prior_findings.push(PriorFinding {
            kind: SpecialistKind::EntityResearch,
            findings: vec!["Entity exhibits shell company characteristics".into()],
        });
        let corroborated = specialist.run(&ctx, CancellationToken::new()).await.unwrap();

        assert_eq!(alone.risk_score, 60.0);
        assert_eq!(corroborated.risk_score, 65.0);
    }

    #[tokio::test]
    async fn test_pattern_hints_become_findings() {
        let specialist = RuleBasedSpecialist::geographic_routing();
        let mut ctx = context(SpecialistKind::GeographicRouting, "wire to cayman");
        ctx.pattern_hints = vec![
            "pattern:geographic-routing:ab12".to_string(),
            "pattern:chain-tracing:cd34".to_string(),
        ];

        let report = specialist.run(&ctx, CancellationToken::new()).await.unwrap();
        assert!(report
            .findings
            .iter()
            .any(|f| f.contains("pattern:geographic-routing:ab12")));
        assert!(!report.findings.iter().any(|f| f.contains("chain-tracing")));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let specialist = RuleBasedSpecialist::entity_research();
        let token = CancellationToken::new();
        token.cancel();

        let err = specialist
            .run(&context(SpecialistKind::EntityResearch, "shell"), token)
            .await
            .unwrap_err();
        assert!(matches!(err, InvestigationError::CollaboratorError(_)));
    }

    #[test]
    fn test_registries_cover_every_kind() {
        let registry = create_default_registry();
        assert_eq!(registry.kinds(), SpecialistKind::ALL.to_vec());

        let http = create_http_registry("http://localhost:9000/").unwrap();
        assert_eq!(http.kinds().len(), 4);
    }

    #[test]
    fn test_http_endpoint() {
        let specialist = HttpSpecialist::new(SpecialistKind::ChainTracing, "http://analysis:9000/").unwrap();
        assert_eq!(specialist.endpoint(), "http://analysis:9000/specialists/chain-tracing");
    }
}
