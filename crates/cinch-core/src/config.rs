//! Packing configuration.
//!
//! The engine takes one immutable [`PackConfig`] at construction instead
//! of consulting process-wide state.  Tristate options stay unresolved
//! here; the engine records the resolved value in its own state when the
//! input dictates a default.

/// Number of well-known resource types (RT_CURSOR .. RT_MANIFEST).
pub const RT_LAST: usize = 25;

/// A yes/no option with an "auto" third state resolved against the
/// input image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tristate {
    #[default]
    Auto,
    No,
    Yes,
}

impl Tristate {
    pub fn is_auto(self) -> bool {
        self == Tristate::Auto
    }

    /// Resolve, taking `default` when still `Auto`.
    pub fn unwrap_or(self, default: bool) -> bool {
        match self {
            Tristate::Auto => default,
            Tristate::No => false,
            Tristate::Yes => true,
        }
    }
}

impl From<bool> for Tristate {
    fn from(v: bool) -> Self {
        if v {
            Tristate::Yes
        } else {
            Tristate::No
        }
    }
}

#[derive(Debug, Clone)]
pub struct PackConfig {
    /// Relax structural checks: odd reloc blocks, duplicate relocs,
    /// superfluous inter-section padding, ASLR stripping, non-default
    /// imagebase stripping.
    pub force: bool,
    /// Require a byte-identical round trip; the PE pack path refuses.
    pub exact: bool,
    /// Compression level handed to the codec (1..=9).
    pub level: u32,
    /// Strip the base relocation directory.  `Auto` strips plain
    /// executables sitting at or above the default imagebase.
    pub strip_relocs: Tristate,
    /// Compress the export directory (only honored for non-DLLs).
    pub compress_exports: bool,
    /// Compress resource leaves.  `Auto` means yes except for EFI.
    pub compress_resources: Tristate,
    /// Icon policy: 0 never, 1 keep the first icon of the first group,
    /// 2 keep every icon of the first group, 3 compress icon groups too.
    pub compress_icons: u8,
    /// Per-resource-type overrides, indexed by RT_* id.
    pub compress_rt: [Tristate; RT_LAST],
    /// `"type[/name],..."` patterns naming resources to keep
    /// uncompressed; numbers compare by value, everything else against
    /// the UTF-16 name.
    pub keep_resource: String,
}

impl Default for PackConfig {
    fn default() -> Self {
        PackConfig {
            force: false,
            exact: false,
            level: 7,
            strip_relocs: Tristate::Auto,
            compress_exports: false,
            compress_resources: Tristate::Auto,
            compress_icons: 1,
            compress_rt: [Tristate::Auto; RT_LAST],
            keep_resource: String::new(),
        }
    }
}
