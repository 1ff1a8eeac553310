//! Prompt matching over the device output stream.
//!
//! This module owns the byte accumulation buffer and the end-of-output
//! detection: vendor prompt regexes for CLI sessions, the `]]>]]>` marker
//! for NETCONF.

mod buffer;
mod matcher;

pub use buffer::{PatternBuffer, DEFAULT_SEARCH_DEPTH};
pub use matcher::{normalize_output, PromptMatch, PromptMatcher, PromptSet, NETCONF_EOM};
