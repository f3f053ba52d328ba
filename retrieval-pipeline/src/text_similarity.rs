/// Textual similarity between two chunk bodies, used to disambiguate
/// near-duplicate neighbours in embedding space.
///
/// The ratio is `2·lcs / (|a| + |b|)` over characters, which lands in
/// `[0, 1]` with 1.0 for identical strings. Pairs whose DP table would be
/// unreasonably large return `None`; callers treat that as "skip the
/// re-rank", never as an error.
const MAX_DP_CELLS: usize = 4_000_000;

pub fn similarity_ratio(a: &str, b: &str) -> Option<f32> {
    let left: Vec<char> = a.chars().collect();
    let right: Vec<char> = b.chars().collect();

    let total = left.len() + right.len();
    if total == 0 {
        return Some(1.0);
    }
    if left.is_empty() || right.is_empty() {
        return Some(0.0);
    }
    if left.len().saturating_mul(right.len()) > MAX_DP_CELLS {
        return None;
    }

    let lcs = lcs_length(&left, &right);

    Some(2.0 * lcs as f32 / total as f32)
}

/// Longest common subsequence length with a rolling two-row table.
fn lcs_length(left: &[char], right: &[char]) -> usize {
    let mut previous = vec![0usize; right.len() + 1];
    let mut current = vec![0usize; right.len() + 1];

    for l in left {
        for (j, r) in right.iter().enumerate() {
            current[j + 1] = if l == r {
                previous[j] + 1
            } else {
                previous[j + 1].max(current[j])
            };
        }
        std::mem::swap(&mut previous, &mut current);
    }

    previous[right.len()]
}
