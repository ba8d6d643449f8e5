/// Requested depth of analysis for a parse.
///
/// Levels form a total order; merging two requests for the same document
/// keeps the wider one.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FeatureLevel {
    /// Visible declarations only.
    Declarations,
    /// Declarations plus use sites.
    DeclarationsAndUses,
    /// Everything, including a retained syntax tree.
    Full,
}

impl FeatureLevel {
    /// Least upper bound of two requested levels.
    #[inline]
    pub fn merge(self, other: Self) -> Self {
        self.max(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_the_wider_request() {
        assert_eq!(
            FeatureLevel::Declarations.merge(FeatureLevel::Full),
            FeatureLevel::Full
        );
        assert_eq!(
            FeatureLevel::Full.merge(FeatureLevel::DeclarationsAndUses),
            FeatureLevel::Full
        );
        assert_eq!(
            FeatureLevel::Declarations.merge(FeatureLevel::Declarations),
            FeatureLevel::Declarations
        );
    }
}
