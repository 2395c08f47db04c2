//! Token-level text diff producing ordered [`EditSpan`] sequences.
//!
//! The reconciler needs a diff whose delete spans preserve the exact
//! characters of the original text (so sentinel code points can be recovered
//! from them) and whose granularity is fine enough to keep edits minimal.
//! Tokens are word runs, whitespace runs, and single symbol characters;
//! rare code points used as selection sentinels always tokenize alone.
//!
//! The core is a Myers O(ND) shortest-edit-script search over the token
//! sequences, with common prefix/suffix trimming up front and a bounded
//! search depth. When the bound is exceeded (pathologically dissimilar
//! texts) the diff degrades to one delete-all/insert-all pair over the
//! untrimmed middle, which is always correct, just not minimal.

use tracing::debug;

/// Search-depth bound for the shortest-edit-script search. Past this many
/// edit steps the middle is emitted as a single replace.
const MAX_SEARCH_DEPTH: usize = 2048;

/// The kind of one contiguous diff span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanKind {
    /// Text present in both sequences.
    Equal,
    /// Text present only in the new sequence.
    Insert,
    /// Text present only in the old sequence.
    Delete,
}

/// One contiguous span of the transformation from old to new text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditSpan {
    pub kind: SpanKind,
    pub text: String,
}

impl EditSpan {
    fn new(kind: SpanKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }
}

/// Compute an ordered token-level diff from `old` to `new`.
///
/// Adjacent spans of the same kind are merged; equal inputs yield a single
/// `Equal` span (or nothing for two empty strings).
pub fn token_diff(old: &str, new: &str) -> Vec<EditSpan> {
    let a = tokenize(old);
    let b = tokenize(new);

    // Trim the common prefix and suffix; the expensive search only runs on
    // the differing middle.
    let mut prefix = 0;
    while prefix < a.len() && prefix < b.len() && a[prefix] == b[prefix] {
        prefix += 1;
    }
    let mut suffix = 0;
    while suffix < a.len() - prefix && suffix < b.len() - prefix
        && a[a.len() - 1 - suffix] == b[b.len() - 1 - suffix]
    {
        suffix += 1;
    }

    let mid_a = &a[prefix..a.len() - suffix];
    let mid_b = &b[prefix..b.len() - suffix];

    let mut ops: Vec<(SpanKind, &str)> = Vec::new();
    for token in &a[..prefix] {
        ops.push((SpanKind::Equal, token));
    }
    match myers(mid_a, mid_b) {
        Some(middle) => ops.extend(middle),
        None => {
            // Bounded-out: fall back to a coarse replace of the middle.
            debug!(
                "diff search depth exceeded ({} vs {} tokens), using coarse replace",
                mid_a.len(),
                mid_b.len()
            );
            for token in mid_a {
                ops.push((SpanKind::Delete, token));
            }
            for token in mid_b {
                ops.push((SpanKind::Insert, token));
            }
        }
    }
    for token in &a[a.len() - suffix..] {
        ops.push((SpanKind::Equal, token));
    }

    merge(ops)
}

/// Split text into word runs, whitespace runs, and single symbol chars.
fn tokenize(text: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut chars = text.char_indices().peekable();

    while let Some((start, c)) = chars.next() {
        let class = char_class(c);
        let mut end = start + c.len_utf8();
        if class != CharClass::Symbol {
            while let Some(&(i, next)) = chars.peek() {
                if char_class(next) != class {
                    break;
                }
                end = i + next.len_utf8();
                chars.next();
            }
        }
        tokens.push(&text[start..end]);
    }
    tokens
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CharClass {
    Word,
    Space,
    /// Symbols (and sentinel code points) are one token each.
    Symbol,
}

fn char_class(c: char) -> CharClass {
    if c.is_alphanumeric() || c == '_' {
        CharClass::Word
    } else if c.is_whitespace() {
        CharClass::Space
    } else {
        CharClass::Symbol
    }
}

/// Myers shortest-edit-script over token slices.
///
/// Returns `None` when the search depth exceeds [`MAX_SEARCH_DEPTH`].
fn myers<'a>(a: &[&'a str], b: &[&'a str]) -> Option<Vec<(SpanKind, &'a str)>> {
    let n = a.len() as isize;
    let m = b.len() as isize;
    if n == 0 && m == 0 {
        return Some(Vec::new());
    }

    let max = (n + m).min(MAX_SEARCH_DEPTH as isize);
    let offset = max;
    let mut v = vec![0isize; (2 * max + 2) as usize];
    // trace[d] holds the x values for k = -d, -d+2, .., d at depth d.
    let mut trace: Vec<Vec<isize>> = Vec::new();
    let mut found_d = None;

    'search: for d in 0..=max {
        let mut snapshot = Vec::with_capacity(d as usize + 1);
        let mut k = -d;
        while k <= d {
            let idx = (k + offset) as usize;
            let mut x = if k == -d || (k != d && v[idx - 1] < v[idx + 1]) {
                v[idx + 1]
            } else {
                v[idx - 1] + 1
            };
            let mut y = x - k;
            while x < n && y < m && a[x as usize] == b[y as usize] {
                x += 1;
                y += 1;
            }
            v[idx] = x;
            snapshot.push(x);
            if x >= n && y >= m {
                trace.push(snapshot);
                found_d = Some(d);
                break 'search;
            }
            k += 2;
        }
        trace.push(snapshot);
    }

    let d_final = found_d?;

    // Backtrack from (n, m) through the per-depth snapshots.
    let get = |d: isize, k: isize| -> isize { trace[d as usize][((k + d) / 2) as usize] };
    let mut rev: Vec<(SpanKind, &str)> = Vec::new();
    let (mut x, mut y) = (n, m);
    let mut d = d_final;
    while d > 0 {
        let k = x - y;
        let from_down = k == -(d) || (k != d && get(d - 1, k - 1) < get(d - 1, k + 1));
        let prev_k = if from_down { k + 1 } else { k - 1 };
        let prev_x = get(d - 1, prev_k);
        let prev_y = prev_x - prev_k;

        while x > prev_x && y > prev_y {
            rev.push((SpanKind::Equal, a[(x - 1) as usize]));
            x -= 1;
            y -= 1;
        }
        if from_down {
            rev.push((SpanKind::Insert, b[(prev_y) as usize]));
        } else {
            rev.push((SpanKind::Delete, a[(prev_x) as usize]));
        }
        x = prev_x;
        y = prev_y;
        d -= 1;
    }
    while x > 0 && y > 0 {
        rev.push((SpanKind::Equal, a[(x - 1) as usize]));
        x -= 1;
        y -= 1;
    }

    rev.reverse();
    Some(rev)
}

/// Merge consecutive same-kind token ops into contiguous spans.
fn merge(ops: Vec<(SpanKind, &str)>) -> Vec<EditSpan> {
    let mut spans: Vec<EditSpan> = Vec::new();
    for (kind, text) in ops {
        match spans.last_mut() {
            Some(last) if last.kind == kind => last.text.push_str(text),
            _ => spans.push(EditSpan::new(kind, text)),
        }
    }
    spans
}
