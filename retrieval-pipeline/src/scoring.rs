use common::{
    storage::types::document_chunk::DocumentChunk,
    utils::config::{AggregationMethod, DistanceMetric},
};

/// Weight of a chunk inside its document: longer chunks weigh more and the
/// head chunk counts double.
pub fn chunk_weight(chunk: &DocumentChunk) -> f32 {
    let size_weight = chunk.content.len() as f32;
    let position_weight = if chunk.parent_id.is_none() { 2.0 } else { 1.0 };
    size_weight * position_weight
}

/// Blends the raw metric score with a textual similarity coefficient in
/// `[0, 1]`. For `inner` both components are higher-is-better; for the
/// distance metrics the coefficient is flipped into a distance first.
pub fn combine_with_text_similarity(
    raw_score: f32,
    text_similarity: f32,
    metric: DistanceMetric,
) -> f32 {
    if metric.higher_is_better() {
        (raw_score + text_similarity) / 2.0
    } else {
        (raw_score + (1.0 - text_similarity)) / 2.0
    }
}

/// Folds `(score, weight)` pairs of one document into a single score.
///
/// Non-finite scores coming from upstream are skipped. An empty (or fully
/// skipped) input and a zero weight sum both aggregate to 0 rather than
/// dividing by zero.
pub fn aggregate_scores(
    pairs: &[(f32, f32)],
    method: AggregationMethod,
    metric: DistanceMetric,
    top_k: usize,
) -> f32 {
    let valid: Vec<(f32, f32)> = pairs
        .iter()
        .copied()
        .filter(|(score, _)| score.is_finite())
        .collect();

    if valid.is_empty() {
        return 0.0;
    }

    match method {
        AggregationMethod::Mean => weighted_mean(&valid),
        AggregationMethod::Max => {
            let mut best = valid[0].0;
            for (score, _) in &valid[1..] {
                if metric.higher_is_better() {
                    best = best.max(*score);
                } else {
                    best = best.min(*score);
                }
            }
            best
        }
        AggregationMethod::TopKMean => {
            let mut sorted = valid;
            if metric.higher_is_better() {
                sorted.sort_by(|a, b| b.0.total_cmp(&a.0));
            } else {
                sorted.sort_by(|a, b| a.0.total_cmp(&b.0));
            }
            sorted.truncate(top_k.max(1));
            weighted_mean(&sorted)
        }
    }
}

fn weighted_mean(pairs: &[(f32, f32)]) -> f32 {
    let total_weight: f32 = pairs.iter().map(|(_, weight)| weight).sum();
    if total_weight == 0.0 {
        return 0.0;
    }
    pairs
        .iter()
        .map(|(score, weight)| score * weight)
        .sum::<f32>()
        / total_weight
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(content: &str, parent_id: Option<&str>) -> DocumentChunk {
        DocumentChunk::new(
            "doc".to_string(),
            parent_id.map(ToString::to_string),
            content.to_string(),
            vec![0.0; 3],
        )
    }

    #[test]
    fn head_chunks_weigh_double() {
        let head = chunk("abcd", None);
        let tail = chunk("abcd", Some("head-id"));

        assert!((chunk_weight(&head) - 8.0).abs() < f32::EPSILON);
        assert!((chunk_weight(&tail) - 4.0).abs() < f32::EPSILON);
    }

    #[test]
    fn combine_flips_similarity_for_distance_metrics() {
        // Distance metric: an identical text (t = 1) halves the distance.
        let distance = combine_with_text_similarity(0.4, 1.0, DistanceMetric::Cosine);
        assert!((distance - 0.2).abs() < 1e-6);

        // Inner product: similarity is added as-is.
        let inner = combine_with_text_similarity(0.4, 1.0, DistanceMetric::Inner);
        assert!((inner - 0.7).abs() < 1e-6);
    }

    #[test]
    fn weighted_mean_respects_weights() {
        let pairs = [(0.0, 3.0), (1.0, 1.0)];
        let mean = aggregate_scores(
            &pairs,
            AggregationMethod::Mean,
            DistanceMetric::Cosine,
            3,
        );
        assert!((mean - 0.25).abs() < 1e-6);
    }

    #[test]
    fn mean_stays_within_input_bounds() {
        let pairs = [(0.2, 1.0), (0.8, 2.5), (0.5, 0.1)];
        for method in [AggregationMethod::Mean, AggregationMethod::TopKMean] {
            let aggregated =
                aggregate_scores(&pairs, method, DistanceMetric::Cosine, 3);
            assert!(
                (0.2..=0.8).contains(&aggregated),
                "aggregated {aggregated} escaped input bounds"
            );
        }
    }

    #[test]
    fn max_follows_metric_direction() {
        let pairs = [(0.2, 1.0), (0.8, 1.0)];

        let best_distance =
            aggregate_scores(&pairs, AggregationMethod::Max, DistanceMetric::L2, 3);
        assert!((best_distance - 0.2).abs() < f32::EPSILON);

        let best_inner =
            aggregate_scores(&pairs, AggregationMethod::Max, DistanceMetric::Inner, 3);
        assert!((best_inner - 0.8).abs() < f32::EPSILON);
    }

    #[test]
    fn top_k_mean_uses_best_scoring_pairs() {
        let pairs = [(0.1, 1.0), (0.2, 1.0), (0.9, 1.0), (0.8, 1.0)];

        let aggregated = aggregate_scores(
            &pairs,
            AggregationMethod::TopKMean,
            DistanceMetric::Cosine,
            2,
        );
        // Lower-is-better: top 2 are 0.1 and 0.2.
        assert!((aggregated - 0.15).abs() < 1e-6);

        let aggregated_inner = aggregate_scores(
            &pairs,
            AggregationMethod::TopKMean,
            DistanceMetric::Inner,
            2,
        );
        // Higher-is-better: top 2 are 0.9 and 0.8.
        assert!((aggregated_inner - 0.85).abs() < 1e-6);
    }

    #[test]
    fn nan_scores_are_skipped() {
        let pairs = [(f32::NAN, 5.0), (0.4, 1.0)];
        let aggregated = aggregate_scores(
            &pairs,
            AggregationMethod::Mean,
            DistanceMetric::Cosine,
            3,
        );
        assert!((aggregated - 0.4).abs() < 1e-6);
    }

    #[test]
    fn empty_or_zero_weight_inputs_aggregate_to_zero() {
        assert_eq!(
            aggregate_scores(&[], AggregationMethod::Mean, DistanceMetric::Cosine, 3),
            0.0
        );
        assert_eq!(
            aggregate_scores(
                &[(f32::NAN, 1.0)],
                AggregationMethod::Mean,
                DistanceMetric::Cosine,
                3
            ),
            0.0
        );
        assert_eq!(
            aggregate_scores(
                &[(0.5, 0.0), (0.7, 0.0)],
                AggregationMethod::Mean,
                DistanceMetric::Cosine,
                3
            ),
            0.0
        );
    }
}
