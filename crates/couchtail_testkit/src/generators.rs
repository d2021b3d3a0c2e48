//! Property-based test generators using proptest.
//!
//! Provides strategies for generating feeds whose sequences increase
//! strictly, and for cutting a byte stream into arbitrary chunks.

use crate::fixtures::{delete_line, heartbeat_line, last_seq_line, update_line};
use proptest::prelude::*;
use serde_json::{Map, Value};

/// One line of a generated feed.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedLine {
    /// An update of `id` at `seq`.
    Update {
        /// Sequence number.
        seq: u64,
        /// Document identifier.
        id: String,
    },
    /// A deletion of `id` at `seq`.
    Delete {
        /// Sequence number.
        seq: u64,
        /// Document identifier.
        id: String,
    },
    /// An end-of-batch summary.
    LastSeq(u64),
    /// An idle heartbeat.
    Heartbeat,
    /// A line that is not JSON.
    Garbage(String),
}

impl FeedLine {
    /// The wire text of this line, terminator included.
    pub fn render(&self) -> String {
        match self {
            FeedLine::Update { seq, id } => {
                update_line(*seq, id, Value::Object(Map::new()))
            }
            FeedLine::Delete { seq, id } => delete_line(*seq, id),
            FeedLine::LastSeq(seq) => last_seq_line(*seq),
            FeedLine::Heartbeat => heartbeat_line(),
            FeedLine::Garbage(text) => format!("{text}\n"),
        }
    }

    /// The sequence of a change line, `None` for everything else.
    pub fn change_seq(&self) -> Option<u64> {
        match self {
            FeedLine::Update { seq, .. } | FeedLine::Delete { seq, .. } => Some(*seq),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
enum LineKind {
    Update(String),
    Delete(String),
    LastSeq,
    Heartbeat,
    Garbage(String),
}

/// Strategy for generating document identifiers.
pub fn doc_id_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z0-9][a-z0-9_-]{0,15}").expect("Invalid regex")
}

/// Strategy for generating flat document bodies without reserved fields.
pub fn doc_body_strategy() -> impl Strategy<Value = Map<String, Value>> {
    prop::collection::btree_map(
        prop::string::string_regex("[a-z][a-z0-9]{0,8}").expect("Invalid regex"),
        prop_oneof![
            any::<i64>().prop_map(Value::from),
            any::<bool>().prop_map(Value::from),
            "[ -~]{0,16}".prop_map(Value::from),
        ],
        0..6,
    )
    .prop_map(|fields| fields.into_iter().collect())
}

/// Strategy for generating a feed of up to `max_lines` lines. Change lines
/// carry strictly increasing sequences starting at 1.
pub fn feed_strategy(max_lines: usize) -> impl Strategy<Value = Vec<FeedLine>> {
    let kind = prop_oneof![
        6 => doc_id_strategy().prop_map(LineKind::Update),
        2 => doc_id_strategy().prop_map(LineKind::Delete),
        1 => Just(LineKind::LastSeq),
        1 => Just(LineKind::Heartbeat),
        1 => "[a-z ]{1,12}".prop_map(LineKind::Garbage),
    ];
    prop::collection::vec(kind, 0..=max_lines).prop_map(|kinds| {
        let mut seq = 0;
        kinds
            .into_iter()
            .map(|kind| match kind {
                LineKind::Update(id) => {
                    seq += 1;
                    FeedLine::Update { seq, id }
                }
                LineKind::Delete(id) => {
                    seq += 1;
                    FeedLine::Delete { seq, id }
                }
                LineKind::LastSeq => FeedLine::LastSeq(seq),
                LineKind::Heartbeat => FeedLine::Heartbeat,
                LineKind::Garbage(text) => FeedLine::Garbage(text),
            })
            .collect()
    })
}

/// Strategy for generating cut positions into a stream of `len` bytes.
pub fn cut_points_strategy(len: usize) -> impl Strategy<Value = Vec<usize>> {
    prop::collection::vec(0..=len, 0..16).prop_map(|mut cuts| {
        cuts.sort_unstable();
        cuts.dedup();
        cuts
    })
}

/// Splits `bytes` at the given sorted positions.
pub fn split_at_points(bytes: &[u8], cuts: &[usize]) -> Vec<Vec<u8>> {
    let mut chunks = Vec::with_capacity(cuts.len() + 1);
    let mut start = 0;
    for &cut in cuts {
        let cut = cut.clamp(start, bytes.len());
        chunks.push(bytes[start..cut].to_vec());
        start = cut;
    }
    chunks.push(bytes[start..].to_vec());
    chunks
}

/// Renders a generated feed into its response body.
pub fn render_feed(lines: &[FeedLine]) -> String {
    lines.iter().map(FeedLine::render).collect()
}
