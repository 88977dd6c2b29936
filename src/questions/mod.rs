//! Question generator trait and implementations
//!
//! Follow-up questions refine the analyst's initial query before dispatch.
//! The template generator is deterministic and doubles as the fallback for
//! the LLM-backed one.

use crate::models::Question;
use crate::Result;
use async_trait::async_trait;

pub mod gemini;
pub use gemini::GeminiQuestionGenerator;

/// Trait for follow-up question generation
#[async_trait]
pub trait QuestionGenerator: Send + Sync {
    async fn generate_questions(&self, query: &str) -> Result<Vec<Question>>;
}

struct TemplateSet {
    triggers: &'static [&'static str],
    questions: &'static [(&'static str, [&'static str; 4])],
}

const WIRE_TRANSFER: TemplateSet = TemplateSet {
    triggers: &["wire", "transfer", "send", "remit"],
    questions: &[
        (
            "What is the customer's stated business activity?",
            [
                "Import/Export business",
                "Professional services",
                "Retail/wholesale trade",
                "Real estate transactions",
            ],
        ),
        (
            "Is this transaction amount typical for this customer?",
            [
                "Yes, consistent with normal activity",
                "No, significantly higher than usual",
                "No, much lower than expected",
                "First transaction - no history available",
            ],
        ),
        (
            "What is the geographic risk profile?",
            [
                "Both countries are low-risk jurisdictions",
                "Destination is high-risk/offshore jurisdiction",
                "Origin is high-risk jurisdiction",
                "Multiple jurisdictions involved in routing",
            ],
        ),
        (
            "What documentation was provided for this transfer?",
            [
                "Complete commercial invoices and contracts",
                "Basic transfer instructions only",
                "Suspicious or altered documentation",
                "No supporting documentation provided",
            ],
        ),
    ],
};

const CASH_STRUCTURING: TemplateSet = TemplateSet {
    triggers: &["cash", "deposit", "structur", "$10,000", "threshold"],
    questions: &[
        (
            "What is the pattern of these cash deposits?",
            [
                "Single large deposit",
                "Multiple deposits just under $10,000",
                "Multiple small deposits over time",
                "Deposits across multiple branches/accounts",
            ],
        ),
        (
            "What is the customer's stated source of funds?",
            [
                "Salary from employment",
                "Cash business proceeds",
                "Sale of assets/investments",
                "Vague or inconsistent explanations",
            ],
        ),
        (
            "Does the activity match the customer profile?",
            [
                "Yes, consistent with known business",
                "No, customer profile suggests different activity",
                "Customer is new with limited profile",
                "Significant change from historical patterns",
            ],
        ),
    ],
};

const SHELL_ENTITY: TemplateSet = TemplateSet {
    triggers: &["shell", "company", "entity", "beneficiary", "owner"],
    questions: &[
        (
            "What information is available about the entity?",
            [
                "Full corporate records and beneficial ownership",
                "Basic registration information only",
                "Limited or suspicious documentation",
                "Entity appears to be shell/nominee",
            ],
        ),
        (
            "What is the business relationship with our customer?",
            [
                "Long-standing legitimate business partner",
                "Recent business relationship",
                "One-time transaction with new entity",
                "Relationship unclear or suspicious",
            ],
        ),
        (
            "What is the entity's jurisdiction and risk profile?",
            [
                "Incorporated in low-risk jurisdiction",
                "Offshore jurisdiction with banking secrecy",
                "High-risk jurisdiction with weak AML controls",
                "Multiple layers of corporate structures",
            ],
        ),
    ],
};

const GENERIC: TemplateSet = TemplateSet {
    triggers: &[],
    questions: &[
        (
            "What type of suspicious activity is indicated?",
            [
                "Unusual transaction patterns",
                "Geographic/jurisdictional concerns",
                "Customer behavior anomalies",
                "Documentation or identity issues",
            ],
        ),
        (
            "What is the potential money laundering stage?",
            [
                "Placement (introducing illicit funds)",
                "Layering (complex transactions to obscure)",
                "Integration (funds appear legitimate)",
                "Multiple stages involved",
            ],
        ),
        (
            "What is the urgency level for investigation?",
            [
                "High - immediate escalation required",
                "Medium - investigate within 24 hours",
                "Standard - routine investigation timeline",
                "Low - monitor for additional activity",
            ],
        ),
    ],
};

/// Checked in order; the first set whose trigger occurs wins
const TEMPLATE_SETS: [&TemplateSet; 3] = [&WIRE_TRANSFER, &CASH_STRUCTURING, &SHELL_ENTITY];

/// Deterministic keyword-selected question templates
pub struct TemplateQuestionGenerator;

impl TemplateQuestionGenerator {
    pub fn questions_for(query: &str) -> Vec<Question> {
        let lowered = query.to_lowercase();

        let set = TEMPLATE_SETS
            .iter()
            .find(|set| set.triggers.iter().any(|t| lowered.contains(t)))
            .copied()
            .unwrap_or(&GENERIC);

        set.questions
            .iter()
            .map(|(question, options)| Question {
                question: question.to_string(),
                options: options.iter().map(|o| o.to_string()).collect(),
            })
            .collect()
    }
}

#[async_trait]
impl QuestionGenerator for TemplateQuestionGenerator {
    async fn generate_questions(&self, query: &str) -> Result<Vec<Question>> {
        Ok(Self::questions_for(query))
    }
}

/// Generator that asks no follow-up questions
pub struct NoQuestions;

#[async_trait]
impl QuestionGenerator for NoQuestions {
    async fn generate_questions(&self, _query: &str) -> Result<Vec<Question>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_template_selected() {
        let questions = TemplateQuestionGenerator::questions_for("Wire transfer to Cyprus");
        assert_eq!(questions.len(), 4);
        assert_eq!(questions[2].question, "What is the geographic risk profile?");
    }

    #[test]
    fn test_first_matching_set_wins() {
        // "deposit" and "company" both present; cash set is checked first
        let questions = TemplateQuestionGenerator::questions_for("Cash deposit by a company");
        assert_eq!(questions[0].question, "What is the pattern of these cash deposits?");
    }

    #[test]
    fn test_generic_fallback() {
        let questions = TemplateQuestionGenerator::questions_for("Something odd happened");
        assert_eq!(questions.len(), 3);
        assert!(questions.iter().all(|q| q.options.len() == 4));
    }

    #[tokio::test]
    async fn test_trait_impls() {
        let questions = TemplateQuestionGenerator
            .generate_questions("beneficiary owner unknown")
            .await
            .unwrap();
        assert_eq!(questions[0].question, "What information is available about the entity?");

        assert!(NoQuestions.generate_questions("x").await.unwrap().is_empty());
    }
}
