use crate::transfer::EntityType;

/// What to do when the destination already has an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum, serde::Serialize, serde::Deserialize)]
pub enum OverwritePolicy {
    #[default]
    Always,
    Never,
    /// Ask the [`OverwritePrompter`]
    Prompt,
    /// Overwrite only when the source was modified after the destination
    IfSourceNewer,
}

/// Answers "overwrite this?" when the policy leaves it to the user.
pub trait OverwritePrompter: Send + Sync {
    fn should_overwrite(&self, path: &std::path::Path, entity: EntityType) -> bool;
}

impl<F> OverwritePrompter for F
where
    F: Fn(&std::path::Path, EntityType) -> bool + Send + Sync,
{
    fn should_overwrite(&self, path: &std::path::Path, entity: EntityType) -> bool {
        self(path, entity)
    }
}

/// Prompter for non-interactive runs: never overwrites.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeclineAll;

impl OverwritePrompter for DeclineAll {
    fn should_overwrite(&self, _path: &std::path::Path, _entity: EntityType) -> bool {
        false
    }
}

impl OverwritePolicy {
    /// Whether a file whose destination copy was last modified at `destination_modified` should be
    /// replaced.
    pub fn should_overwrite_file(
        self,
        path: &std::path::Path,
        source_modified: Option<std::time::SystemTime>,
        destination_modified: std::time::SystemTime,
        prompter: &dyn OverwritePrompter,
    ) -> bool {
        match self {
            Self::Always => true,
            Self::Never => false,
            Self::Prompt => prompter.should_overwrite(path, EntityType::File),
            // unknown source time: copying is the safe choice
            Self::IfSourceNewer => {
                source_modified.is_none_or(|source| source > destination_modified)
            }
        }
    }
}
