/// Longest accepted object name (modules, devices).
pub const MAX_NAME_LENGTH: usize = 128;

/// A bounded, inline name. Error paths carry these instead of heap strings
/// so reporting a failure can never itself fail on allocation.
pub type Name = heapless::String<MAX_NAME_LENGTH>;

/// Builds a [`Name`], truncating at the capacity. Truncation lands on a
/// UTF-8 boundary.
pub fn truncated_name(s: &str) -> Name {
    let mut end = s.len().min(MAX_NAME_LENGTH);
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    Name::try_from(&s[..end]).expect("truncated to capacity")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncated_name("short").as_str(), "short");

        let long: alloc::string::String =
            core::iter::repeat_n('é', 100).collect();
        let name = truncated_name(&long);
        assert!(name.len() <= MAX_NAME_LENGTH);
        assert!(name.as_str().chars().all(|c| c == 'é'));
    }
}
