//! Latent width selection for variational exports.

/// Number of latent channels to keep for a given fidelity target.
///
/// `fidelity` is the cumulative explained-variance curve of the trained
/// model's latent components, ordered by descending variance. The smallest
/// prefix whose last component exceeds `threshold` is kept, rounded up to
/// the next power of two for predictable downstream buffer sizing, and
/// capped at the full width.
///
/// A curve that never exceeds the threshold keeps the full width: collapsing
/// to a single channel would make the selection non-monotonic in the
/// threshold and silently discard almost the whole representation.
pub fn select_latent_size(fidelity: &[f32], threshold: f32, full_size: usize) -> usize {
    let kept = match fidelity.iter().position(|&f| f > threshold) {
        Some(index) => index + 1,
        None => full_size,
    };
    kept.max(1).next_power_of_two().min(full_size.max(1))
}
