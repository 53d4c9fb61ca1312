/// Parses the base relocation directory goblin doesn't expose directly.
pub(crate) mod base_relocations;
/// PE file headers
pub(crate) mod headers;
/// Helper for interacting with PE files
pub(crate) mod pe_info;
/// RVA-to-file-offset lookups against a PE section table.
pub(crate) mod section_table;
