//! Built-in supplier scorer
//!
//! Deterministic category-and-keyword scorer used when no external
//! matching engine is wired in. Deployments with a dedicated matcher
//! swap this out behind the `MatchScorer` trait.

use supplymatch_billing::{BillingResult, MatchRequestSummary, MatchScore, MatchScorer, Supplier};

const CATEGORY_MATCH_POINTS: i32 = 60;
const KEYWORD_POINTS: i32 = 10;
const MAX_SCORE: i32 = 100;

pub struct CategoryScorer;

impl CategoryScorer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CategoryScorer {
    fn default() -> Self {
        Self::new()
    }
}

impl MatchScorer for CategoryScorer {
    fn score(
        &self,
        request: &MatchRequestSummary,
        supplier: &Supplier,
    ) -> BillingResult<MatchScore> {
        let mut score = 0;
        let mut factors = Vec::new();

        if request.category.eq_ignore_ascii_case(&supplier.category) {
            score += CATEGORY_MATCH_POINTS;
            factors.push(format!("category match: {}", supplier.category));
        }

        // Each request keyword appearing in the supplier name adds a
        // little signal, capped so category stays dominant
        let name = supplier.name.to_lowercase();
        let summary = request.summary.to_lowercase();
        for word in summary.split_whitespace().filter(|w| w.len() >= 4) {
            if score >= MAX_SCORE {
                break;
            }
            if name.contains(word) {
                score = (score + KEYWORD_POINTS).min(MAX_SCORE);
                factors.push(format!("keyword: {word}"));
            }
        }

        let explanation = if factors.is_empty() {
            "no category or keyword overlap".to_string()
        } else {
            factors.join("; ")
        };

        Ok(MatchScore {
            score,
            factors,
            explanation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn request(category: &str, summary: &str) -> MatchRequestSummary {
        MatchRequestSummary {
            request_id: "req_1".to_string(),
            email: "buyer@example.com".to_string(),
            summary: summary.to_string(),
            category: category.to_string(),
        }
    }

    fn supplier(name: &str, category: &str) -> Supplier {
        Supplier {
            id: Uuid::new_v4(),
            name: name.to_string(),
            category: category.to_string(),
            contact_email: None,
            contact_phone: None,
            website: None,
        }
    }

    #[test]
    fn test_category_match_dominates() {
        let scorer = CategoryScorer::new();
        let score = scorer
            .score(
                &request("packaging", "custom boxes"),
                &supplier("Acme Corrugated", "packaging"),
            )
            .unwrap();
        assert_eq!(score.score, 60);
    }

    #[test]
    fn test_keywords_add_on_top_of_category() {
        let scorer = CategoryScorer::new();
        let score = scorer
            .score(
                &request("packaging", "corrugated boxes supplier"),
                &supplier("Acme Corrugated Boxes", "packaging"),
            )
            .unwrap();
        assert_eq!(score.score, 80);
        assert!(score.factors.len() >= 2);
    }

    #[test]
    fn test_no_overlap_scores_zero() {
        let scorer = CategoryScorer::new();
        let score = scorer
            .score(
                &request("packaging", "custom boxes"),
                &supplier("Steel Works", "metals"),
            )
            .unwrap();
        assert_eq!(score.score, 0);
        assert_eq!(score.explanation, "no category or keyword overlap");
    }

    #[test]
    fn test_score_capped_at_100() {
        let scorer = CategoryScorer::new();
        let score = scorer
            .score(
                &request(
                    "packaging",
                    "boxes boxes boxes boxes boxes boxes boxes boxes",
                ),
                &supplier("Boxes Boxes Boxes", "packaging"),
            )
            .unwrap();
        assert!(score.score <= 100);
    }
}
