/// UI (Unique Identifier) value representation.
pub type UI = String;

/// UL (Unsigned Long) value representation.
pub type UL = u32;

/// US (Unsigned Short) value representation.
pub type US = u16;

/// AE (Application Entity) value representation.
pub type AE = String;
