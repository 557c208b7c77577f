use crate::error::Result;
use crate::pipeline::StageDescriptor;
use crate::stage::{FromDescriptor, Stage};

/// Static description of one registered stage.
pub struct StageEntry {
    /// Token used in pipeline names, e.g. `"bitswap"`.
    pub name: &'static str,
    /// Accepted numeric suffixes. Empty means the stage takes no suffix.
    pub variants: &'static [u32],
    /// Argument keys accepted inside `(...)`.
    pub args: &'static [&'static str],
    /// Lossy by design (possibly only for some arguments).
    pub lossy: bool,
    pub summary: &'static str,
    /// Validate a descriptor without building anything.
    pub check: fn(&StageDescriptor) -> Result<()>,
    pub build: fn(&StageDescriptor) -> Result<Box<dyn Stage>>,
}

impl std::fmt::Debug for StageEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageEntry")
            .field("name", &self.name)
            .field("variants", &self.variants)
            .field("args", &self.args)
            .field("lossy", &self.lossy)
            .finish()
    }
}

/// `check` function for any [`FromDescriptor`] stage.
pub fn check_stage<S: FromDescriptor>(descriptor: &StageDescriptor) -> Result<()> {
    S::from_descriptor(descriptor).map(|_| ())
}

/// `build` function for any [`FromDescriptor`] stage.
pub fn build_stage<S: FromDescriptor + Stage + 'static>(
    descriptor: &StageDescriptor,
) -> Result<Box<dyn Stage>> {
    Ok(Box::new(S::from_descriptor(descriptor)?))
}

/// Read-only table of stages, built at compile time and shared by every call.
#[derive(Debug, Clone, Copy)]
pub struct Registry {
    entries: &'static [StageEntry],
}

impl Registry {
    pub const fn new(entries: &'static [StageEntry]) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &'static [StageEntry] {
        self.entries
    }

    /// Entry registered under exactly `name`.
    pub fn get(&self, name: &str) -> Option<&'static StageEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Resolve a pipeline token such as `"lz4"` or `"bitswap1"`.
    ///
    /// A stage without variants matches its name exactly. Otherwise the
    /// trailing digit run is the variant and must be one the stage declares.
    /// Leading zeros are rejected so every stage has a single spelling.
    pub fn resolve(&self, token: &str) -> Option<(&'static StageEntry, Option<u32>)> {
        if let Some(entry) = self.get(token) {
            return entry.variants.is_empty().then_some((entry, None));
        }
        let stem = token.trim_end_matches(|c: char| c.is_ascii_digit());
        let digits = &token[stem.len()..];
        if stem.is_empty() || digits.is_empty() || (digits.len() > 1 && digits.starts_with('0')) {
            return None;
        }
        let variant: u32 = digits.parse().ok()?;
        let entry = self.get(stem)?;
        entry.variants.contains(&variant).then_some((entry, Some(variant)))
    }
}
