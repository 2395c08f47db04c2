//! Reconciling formatted output against the live editor buffer.
//!
//! Formatting runs out of process against a snapshot of the document. By the
//! time the result arrives the user may have moved on, so applying it takes
//! three steps:
//!
//! 1. [`reconcile`] computes a minimal ordered set of replace-operations
//!    from the snapshot to the formatted text, tracking selection ranges
//!    through the diff with an invisible sentinel character.
//! 2. The caller re-reads the live buffer; [`apply_reconciled`] compares it
//!    byte-for-byte against the snapshot and discards the whole result on
//!    any mismatch (drift) — the user's edits always win.
//! 3. The surviving operations are applied in one atomic transaction and
//!    the recovered selections restored.
//!
//! Sentinel tracking is inherently best-effort: it needs a code point absent
//! from both texts. When none of the pool qualifies, the reconciler falls
//! back to a whole-buffer replace without selection tracking — correctness
//! over precision — and the caller may position the caret from an
//! engine-provided cursor offset instead.
//!
//! All offsets in this module are char offsets, half-open.

use tracing::{debug, warn};

use crate::diff::{token_diff, EditSpan, SpanKind};

/// Candidate sentinel code points, tried in order. Control characters and
/// private-use/noncharacter code points that essentially never appear in
/// source text.
const SENTINEL_POOL: [char; 5] = ['\u{7}', '\u{7F}', '\u{E000}', '\u{E001}', '\u{FDD0}'];

/// A selection range over a document, `[start, end)` in char offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub start: usize,
    pub end: usize,
}

impl Selection {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// A zero-width selection (caret).
    pub fn caret(offset: usize) -> Self {
        Self {
            start: offset,
            end: offset,
        }
    }
}

/// Replace the chars `[start, end)` of the snapshot with `insert`.
///
/// Produced in ascending, non-overlapping snapshot order; a buffer applying
/// them in one transaction can process them back-to-front so earlier offsets
/// stay valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplaceOp {
    pub start: usize,
    pub end: usize,
    pub insert: String,
}

/// The reconciler's verdict for one formatting result.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciled {
    /// Formatted output equals the snapshot; nothing to do.
    Unchanged,
    /// Minimal region edits plus the selections recovered through the diff.
    Edits {
        ops: Vec<ReplaceOp>,
        selections: Vec<Selection>,
    },
    /// No usable sentinel: replace the whole buffer, selection tracking
    /// skipped.
    WholeBuffer,
}

/// Outcome of applying a reconciled result to the live buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Edits applied and selections restored.
    Applied,
    /// The live buffer no longer matches the snapshot; nothing was touched.
    Drifted,
    /// There was nothing to apply.
    Unchanged,
}

/// The editing surface the reconciler applies results to.
///
/// Implemented by the editor integration; [`InMemoryBuffer`] provides a
/// self-contained implementation for tests and headless use.
pub trait EditorBuffer {
    /// Full current text of the buffer.
    fn text(&self) -> String;

    /// Apply all operations as one atomic editing transaction.
    ///
    /// Ops arrive in ascending non-overlapping snapshot offsets.
    fn apply_edits(&mut self, ops: &[ReplaceOp]) -> anyhow::Result<()>;

    /// Replace the buffer's selections.
    fn set_selections(&mut self, selections: &[Selection]);
}

/// Compute the minimal edits and tracked selections for a formatting result.
///
/// `selections` are char ranges into `original`, in any order; touching or
/// overlapping ranges are processed in ascending start order.
pub fn reconcile(original: &str, formatted: &str, selections: &[Selection]) -> Reconciled {
    if original == formatted {
        return Reconciled::Unchanged;
    }

    let Some(sentinel) = pick_sentinel(original, formatted) else {
        warn!("no sentinel available, falling back to whole-buffer replace");
        return Reconciled::WholeBuffer;
    };

    let marked = mark_selections(original, selections, sentinel);
    let spans = token_diff(&marked, formatted);
    let (ops, boundaries) = recover(&spans, sentinel);

    let mut recovered = Vec::new();
    for chunk in boundaries.chunks(2) {
        match chunk {
            [open, close] => recovered.push(Selection::new(*open, (*close).max(*open))),
            // Close sentinel lost in a malformed diff: degrade to a caret
            // at the open offset rather than failing.
            [open] => recovered.push(Selection::caret(*open)),
            _ => {}
        }
    }
    debug!(
        "reconciled {} ops, {} selections",
        ops.len(),
        recovered.len()
    );

    Reconciled::Edits {
        ops,
        selections: recovered,
    }
}

/// Apply a reconciled result to the live buffer, checking for drift first.
///
/// `engine_cursor` is the caret offset reported by a cursor-aware formatting
/// engine; it is used only on the [`Reconciled::WholeBuffer`] path, where
/// sentinel tracking was skipped.
pub fn apply_reconciled<B: EditorBuffer + ?Sized>(
    buffer: &mut B,
    original: &str,
    formatted: &str,
    reconciled: &Reconciled,
    engine_cursor: Option<usize>,
) -> anyhow::Result<ApplyOutcome> {
    if matches!(reconciled, Reconciled::Unchanged) {
        return Ok(ApplyOutcome::Unchanged);
    }

    // The formatting ran against a snapshot; any divergence means the user
    // edited mid-flight and the whole result is stale. Never partially
    // apply.
    if buffer.text() != original {
        debug!("live buffer drifted during formatting, discarding result");
        return Ok(ApplyOutcome::Drifted);
    }

    match reconciled {
        Reconciled::Unchanged => unreachable!("handled above"),
        Reconciled::Edits { ops, selections } => {
            buffer.apply_edits(ops)?;
            buffer.set_selections(selections);
        }
        Reconciled::WholeBuffer => {
            let op = ReplaceOp {
                start: 0,
                end: original.chars().count(),
                insert: formatted.to_string(),
            };
            buffer.apply_edits(&[op])?;
            if let Some(offset) = engine_cursor {
                buffer.set_selections(&[Selection::caret(offset)]);
            }
        }
    }
    Ok(ApplyOutcome::Applied)
}

/// First pool code point absent from both texts, if any.
fn pick_sentinel(original: &str, formatted: &str) -> Option<char> {
    SENTINEL_POOL
        .iter()
        .copied()
        .find(|&c| !original.contains(c) && !formatted.contains(c))
}

/// Insert the sentinel immediately before/after each selection boundary.
///
/// Boundaries are flattened, clamped to the text length, and inserted in
/// ascending offset order; two sentinels bracket each range.
fn mark_selections(original: &str, selections: &[Selection], sentinel: char) -> String {
    let char_count = original.chars().count();
    let mut sorted: Vec<Selection> = selections.to_vec();
    sorted.sort_by_key(|s| (s.start, s.end));

    let mut boundaries: Vec<usize> = Vec::with_capacity(sorted.len() * 2);
    for sel in &sorted {
        boundaries.push(sel.start.min(char_count));
        boundaries.push(sel.end.max(sel.start).min(char_count));
    }
    boundaries.sort_unstable();

    let mut marked = String::with_capacity(original.len() + boundaries.len() * 3);
    let mut next = boundaries.iter().peekable();
    for (offset, c) in original.chars().enumerate() {
        while next.peek() == Some(&&offset) {
            marked.push(sentinel);
            next.next();
        }
        marked.push(c);
    }
    for _ in next {
        marked.push(sentinel);
    }
    marked
}

/// Walk the diff between the marked snapshot and the formatted text,
/// deriving replace-operations (snapshot offsets) and selection boundaries
/// (formatted-text offsets).
///
/// Sentinels never exist in the formatted text, so they always surface
/// inside delete spans; they contribute to neither removal lengths nor
/// snapshot offsets. A sentinel adjacent to surviving text on its left
/// anchors there; otherwise it floats rightward past any inserted text to
/// the start of the next equal region, which is where its neighboring
/// original character landed.
fn recover(spans: &[EditSpan], sentinel: char) -> (Vec<ReplaceOp>, Vec<usize>) {
    let mut ops: Vec<ReplaceOp> = Vec::new();
    let mut boundaries: Vec<usize> = Vec::new();
    // Boundary indices still floating rightward through inserted text.
    let mut floating: Vec<usize> = Vec::new();

    let mut orig_off = 0usize; // into the unmarked snapshot
    let mut new_off = 0usize; // into the formatted text
    let mut pending_start: Option<usize> = None;
    let mut pending_len = 0usize;
    let mut prev_kind: Option<SpanKind> = None;

    for span in spans {
        match span.kind {
            SpanKind::Delete => {
                let mut consumed_in_span = false;
                for c in span.text.chars() {
                    if c == sentinel {
                        let anchored_left = !consumed_in_span
                            && matches!(prev_kind, Some(SpanKind::Equal) | Some(SpanKind::Insert));
                        boundaries.push(new_off);
                        if !anchored_left {
                            floating.push(boundaries.len() - 1);
                        }
                    } else {
                        if pending_start.is_none() {
                            pending_start = Some(orig_off);
                        }
                        pending_len += 1;
                        orig_off += 1;
                        consumed_in_span = true;
                    }
                }
            }
            SpanKind::Insert => {
                // Flush the pending removal together with the inserted text
                // as a single replace-operation.
                let start = pending_start.take().unwrap_or(orig_off);
                ops.push(ReplaceOp {
                    start,
                    end: start + pending_len,
                    insert: span.text.clone(),
                });
                pending_len = 0;

                let inserted = span.text.chars().count();
                new_off += inserted;
                for idx in &floating {
                    boundaries[*idx] += inserted;
                }
            }
            SpanKind::Equal => {
                flush_removal(&mut ops, &mut pending_start, &mut pending_len);
                floating.clear();
                let len = span.text.chars().count();
                orig_off += len;
                new_off += len;
            }
        }
        prev_kind = Some(span.kind);
    }
    // A trailing delete has no following span to flush it; the synthetic
    // final flush stands in for an empty equal span.
    flush_removal(&mut ops, &mut pending_start, &mut pending_len);

    (ops, boundaries)
}

fn flush_removal(ops: &mut Vec<ReplaceOp>, start: &mut Option<usize>, len: &mut usize) {
    if *len > 0 {
        let start = start.take().unwrap_or_default();
        ops.push(ReplaceOp {
            start,
            end: start + *len,
            insert: String::new(),
        });
        *len = 0;
    } else {
        *start = None;
    }
}

/// A plain string-backed [`EditorBuffer`] for tests and headless use.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBuffer {
    text: String,
    selections: Vec<Selection>,
}

impl InMemoryBuffer {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            selections: Vec::new(),
        }
    }

    pub fn selections(&self) -> &[Selection] {
        &self.selections
    }
}

impl EditorBuffer for InMemoryBuffer {
    fn text(&self) -> String {
        self.text.clone()
    }

    fn apply_edits(&mut self, ops: &[ReplaceOp]) -> anyhow::Result<()> {
        let mut chars: Vec<char> = self.text.chars().collect();
        // Back-to-front so earlier offsets stay valid within the single
        // transaction.
        for op in ops.iter().rev() {
            if op.start > op.end || op.end > chars.len() {
                anyhow::bail!(
                    "replace range {}..{} out of bounds (len {})",
                    op.start,
                    op.end,
                    chars.len()
                );
            }
            chars.splice(op.start..op.end, op.insert.chars());
        }
        self.text = chars.into_iter().collect();
        Ok(())
    }

    fn set_selections(&mut self, selections: &[Selection]) {
        self.selections = selections.to_vec();
    }
}
