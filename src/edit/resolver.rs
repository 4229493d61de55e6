//! Edit Resolver (§4.3, component C): turns an agent-emitted
//! [`EditorOperation`] into concrete document offsets, trying progressively
//! looser matching strategies until one succeeds.
//!
//! Grounded on `document_editing_tools.py`'s `apply_operations_directly` /
//! `propose_document_edit_tool`, which anchor each operation the same way —
//! exact offset check, then a verbatim text search, then whitespace-relaxed
//! search, then a prefix/suffix fallback — before giving up on that one
//! operation and moving to the next.

use super::types::{DroppedOperation, EditorOperation, OpType, ResolvedEdit};

const PREFIX_SUFFIX_TOKEN_COUNT: usize = 8;

/// Result of resolving a whole batch of operations against one document
/// body: successfully anchored edits plus anything that had to be dropped.
pub struct ResolveBatch {
    pub resolved: Vec<ResolvedEdit>,
    pub dropped: Vec<DroppedOperation>,
}

/// Resolve every operation in `operations` against `body`, then sort
/// successes by `start` descending so sequential application never
/// invalidates a later offset (§4.3 edge-case policy).
pub fn resolve_batch(
    body: &str,
    operations: Vec<EditorOperation>,
    fm_end: usize,
    cursor_offset: Option<usize>,
) -> ResolveBatch {
    let mut resolved = Vec::new();
    let mut dropped = Vec::new();

    for op in operations {
        match resolve(body, &op, fm_end, cursor_offset) {
            Ok(edit) => resolved.push(edit),
            Err(reason) => {
                log::warn!("edit operation dropped: {reason}");
                dropped.push(DroppedOperation { operation: op, reason });
            }
        }
    }

    resolved.sort_by(|a, b| b.start.cmp(&a.start));
    ResolveBatch { resolved, dropped }
}

/// Splice a start-descending-sorted batch of resolved edits into `body`.
/// Applying in that order means an earlier-in-the-list (later-offset) edit
/// never shifts the offsets a subsequent edit needs.
pub fn apply_resolved_edits(body: &str, edits: &[ResolvedEdit]) -> String {
    let mut out = body.to_string();
    for edit in edits {
        out.replace_range(edit.start..edit.end, &edit.text);
    }
    out
}

/// Resolve a single operation, trying strategies 1-7 of §4.3 in order.
pub fn resolve(
    body: &str,
    op: &EditorOperation,
    fm_end: usize,
    cursor_offset: Option<usize>,
) -> Result<ResolvedEdit, String> {
    if let Some(edit) = try_exact_offsets(body, op) {
        return Ok(clamp_to_frontmatter(edit, fm_end));
    }
    if op.op_type == OpType::InsertAfterHeading {
        if let Some(edit) = try_anchor_match(body, op, cursor_offset) {
            return Ok(clamp_to_frontmatter(edit, fm_end));
        }
    }
    if let Some(edit) = try_original_text_search(body, op, cursor_offset) {
        return Ok(clamp_to_frontmatter(edit, fm_end));
    }
    if let Some(edit) = try_whitespace_normalized_search(body, op, cursor_offset) {
        return Ok(clamp_to_frontmatter(edit, fm_end));
    }
    if let Some(edit) = try_prefix_suffix_anchor(body, op) {
        return Ok(clamp_to_frontmatter(edit, fm_end));
    }
    if let Some(edit) = try_empty_file_fallback(body, op, fm_end) {
        return Ok(edit);
    }
    if let Some(edit) = try_cursor_fallback(op, fm_end, cursor_offset) {
        return Ok(edit);
    }

    Err(format!("no resolution strategy matched for {:?}", op.op_type))
}

fn clamp_to_frontmatter(mut edit: ResolvedEdit, fm_end: usize) -> ResolvedEdit {
    if edit.start < fm_end {
        edit.start = fm_end;
    }
    if edit.end < fm_end {
        edit.end = fm_end;
    }
    edit
}

fn replacement_text(op: &EditorOperation) -> String {
    op.text.clone().unwrap_or_default()
}

/// Strategy 1: exact offsets, verified against `original_text`.
fn try_exact_offsets(body: &str, op: &EditorOperation) -> Option<ResolvedEdit> {
    let (start, end) = (op.start?, op.end?);
    let original_text = op.original_text.as_deref()?;
    if start > end || end > body.len() {
        return None;
    }
    let slice = body.get(start..end)?;
    if normalize_whitespace(slice) != normalize_whitespace(original_text) {
        return None;
    }
    Some(ResolvedEdit { start, end, text: replacement_text(op), confidence: 1.0 })
}

/// Strategy 2: heading anchor search (`insert_after_heading` only).
fn try_anchor_match(body: &str, op: &EditorOperation, cursor_offset: Option<usize>) -> Option<ResolvedEdit> {
    let anchor = op.anchor_text.as_deref()?;
    let positions = find_all_occurrences(body, anchor);
    if positions.is_empty() {
        return None;
    }
    let confidence = if positions.len() == 1 { 0.9 } else { 0.7 };
    let chosen = pick_occurrence(&positions, op.occurrence_index, cursor_offset)?;
    let anchor_end = chosen + anchor.len();
    let line_end = body[anchor_end..].find('\n').map(|i| anchor_end + i + 1).unwrap_or(body.len());
    let text = format!("{}\n", replacement_text(op));
    Some(ResolvedEdit { start: line_end, end: line_end, text, confidence })
}

/// Strategy 3: verbatim search for `original_text`.
fn try_original_text_search(body: &str, op: &EditorOperation, cursor_offset: Option<usize>) -> Option<ResolvedEdit> {
    let original_text = op.original_text.as_deref()?;
    let positions = find_all_occurrences(body, original_text);
    if positions.is_empty() {
        return None;
    }
    let match_start = pick_occurrence(&positions, op.occurrence_index, cursor_offset)?;
    let match_end = match_start + original_text.len();
    Some(range_for_op(op, match_start, match_end, 0.9))
}

/// Strategy 4: collapse whitespace runs in both body and `original_text`,
/// then retry a verbatim search on the normalized text, mapping the match
/// back to original byte offsets.
fn try_whitespace_normalized_search(body: &str, op: &EditorOperation, cursor_offset: Option<usize>) -> Option<ResolvedEdit> {
    let original_text = op.original_text.as_deref()?;
    let (normalized_body, offsets) = normalize_whitespace_with_offsets(body);
    let normalized_needle = normalize_whitespace(original_text);
    if normalized_needle.is_empty() {
        return None;
    }
    let positions = find_all_occurrences(&normalized_body, &normalized_needle);
    if positions.is_empty() {
        return None;
    }
    let match_start_norm = pick_occurrence(&positions, op.occurrence_index, cursor_offset)?;
    let match_end_norm = match_start_norm + normalized_needle.len();
    let match_start = *offsets.get(match_start_norm)?;
    let match_end = offsets.get(match_end_norm).copied().unwrap_or(body.len());
    Some(range_for_op(op, match_start, match_end, 0.75))
}

/// Strategy 5: anchor on the first/last `PREFIX_SUFFIX_TOKEN_COUNT` tokens
/// of `original_text`, requiring both to appear in order with a gap no
/// larger than twice the expected span.
fn try_prefix_suffix_anchor(body: &str, op: &EditorOperation) -> Option<ResolvedEdit> {
    let original_text = op.original_text.as_deref()?;
    let tokens: Vec<&str> = original_text.split_whitespace().collect();
    if tokens.len() < 2 {
        return None;
    }
    let prefix_count = PREFIX_SUFFIX_TOKEN_COUNT.min(tokens.len());
    let prefix = tokens[..prefix_count].join(" ");
    let suffix_count = PREFIX_SUFFIX_TOKEN_COUNT.min(tokens.len());
    let suffix = tokens[tokens.len() - suffix_count..].join(" ");

    let prefix_start = body.find(&prefix)?;
    let prefix_end = prefix_start + prefix.len();
    let max_gap = original_text.len().saturating_mul(2).max(64);
    let search_window_end = (prefix_end + max_gap).min(body.len());
    let suffix_start_in_window = body[prefix_end..search_window_end].find(&suffix)?;
    let suffix_start = prefix_end + suffix_start_in_window;
    let end = suffix_start + suffix.len();

    Some(range_for_op(op, prefix_start, end, 0.5))
}

/// Strategy 6: an effectively empty document body forces insertion right
/// after the frontmatter.
fn try_empty_file_fallback(_body: &str, op: &EditorOperation, fm_end: usize) -> Option<ResolvedEdit> {
    let rest = _body.get(fm_end..)?;
    if !rest.trim().is_empty() {
        return None;
    }
    Some(ResolvedEdit { start: fm_end, end: fm_end, text: replacement_text(op), confidence: 0.7 })
}

/// Strategy 7: fall back to the caller's cursor position, if it's not
/// inside the protected frontmatter.
fn try_cursor_fallback(op: &EditorOperation, fm_end: usize, cursor_offset: Option<usize>) -> Option<ResolvedEdit> {
    let cursor = cursor_offset?;
    if cursor < fm_end {
        return None;
    }
    Some(ResolvedEdit { start: cursor, end: cursor, text: replacement_text(op), confidence: 0.3 })
}

/// Interpret a matched `[match_start, match_end)` span according to the
/// operation's `op_type`: replace/delete use the span directly, insertion
/// ops anchor at the end of the match.
fn range_for_op(op: &EditorOperation, match_start: usize, match_end: usize, confidence: f64) -> ResolvedEdit {
    match op.op_type {
        OpType::ReplaceRange | OpType::DeleteRange => {
            ResolvedEdit { start: match_start, end: match_end, text: replacement_text(op), confidence }
        }
        OpType::InsertAfterHeading | OpType::InsertAfter => {
            ResolvedEdit { start: match_end, end: match_end, text: replacement_text(op), confidence }
        }
    }
}

/// Choose which of several candidate occurrence byte-offsets applies,
/// preferring the one nearest `cursor_offset` when given, else
/// `occurrence_index` (clamped to the available range) per §4.3's
/// tie-break policy.
fn pick_occurrence(positions: &[usize], occurrence_index: usize, cursor_offset: Option<usize>) -> Option<usize> {
    if positions.is_empty() {
        return None;
    }
    if let Some(cursor) = cursor_offset {
        return positions.iter().copied().min_by_key(|p| p.abs_diff(cursor));
    }
    Some(positions[occurrence_index.min(positions.len() - 1)])
}

fn find_all_occurrences(haystack: &str, needle: &str) -> Vec<usize> {
    if needle.is_empty() {
        return Vec::new();
    }
    let mut positions = Vec::new();
    let mut search_from = 0;
    while let Some(found) = haystack[search_from..].find(needle) {
        let absolute = search_from + found;
        positions.push(absolute);
        search_from = absolute + 1;
        if search_from >= haystack.len() {
            break;
        }
    }
    positions
}

fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Like [`normalize_whitespace`], but also returns, for each byte offset in
/// the normalized string, the corresponding byte offset in the original.
fn normalize_whitespace_with_offsets(s: &str) -> (String, Vec<usize>) {
    let mut normalized = String::new();
    let mut offsets = Vec::new();
    let mut prev_was_space = true; // treat leading whitespace as already "collapsed"

    for (idx, ch) in s.char_indices() {
        if ch.is_whitespace() {
            if !prev_was_space {
                normalized.push(' ');
                offsets.push(idx);
            }
            prev_was_space = true;
        } else {
            normalized.push(ch);
            offsets.push(idx);
            prev_was_space = false;
        }
    }
    if normalized.ends_with(' ') {
        normalized.pop();
        offsets.pop();
    }
    offsets.push(s.len());
    (normalized, offsets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edit::types::OpType;

    fn op(op_type: OpType, original_text: &str, text: &str) -> EditorOperation {
        EditorOperation {
            op_type,
            start: None,
            end: None,
            text: Some(text.to_string()),
            original_text: Some(original_text.to_string()),
            anchor_text: None,
            occurrence_index: 0,
            confidence: 0.0,
        }
    }

    #[test]
    fn exact_offsets_win_when_original_text_matches() {
        let body = "hello world";
        let op = EditorOperation {
            op_type: OpType::ReplaceRange,
            start: Some(0),
            end: Some(5),
            text: Some("goodbye".into()),
            original_text: Some("hello".into()),
            anchor_text: None,
            occurrence_index: 0,
            confidence: 0.0,
        };
        let resolved = resolve(body, &op, 0, None).unwrap();
        assert_eq!((resolved.start, resolved.end), (0, 5));
        assert_eq!(resolved.confidence, 1.0);
    }

    #[test]
    fn falls_back_to_verbatim_search_when_offsets_are_wrong() {
        let body = "prefix hello world suffix";
        let mut operation = op(OpType::ReplaceRange, "hello world", "goodbye");
        operation.start = Some(0);
        operation.end = Some(3);
        let resolved = resolve(body, &operation, 0, None).unwrap();
        assert_eq!(&body[resolved.start..resolved.end], "hello world");
        assert_eq!(resolved.confidence, 0.9);
    }

    #[test]
    fn whitespace_normalized_search_matches_reflowed_text() {
        let body = "line one\nline   two\nline three";
        let operation = op(OpType::ReplaceRange, "line two", "replaced");
        let resolved = resolve(body, &operation, 0, None).unwrap();
        assert_eq!(normalize_whitespace(&body[resolved.start..resolved.end]), "line two");
        assert_eq!(resolved.confidence, 0.75);
    }

    #[test]
    fn prefix_suffix_anchor_handles_drifted_middle_text() {
        let body = "alpha beta gamma delta epsilon zeta eta theta iota kappa lambda mu nu xi omicron pi rho";
        // Drift word sits strictly between the first-8 and last-8 token
        // windows, so neither the prefix nor suffix anchor includes it.
        let operation = op(
            OpType::ReplaceRange,
            "alpha beta gamma delta epsilon zeta eta theta iota DRIFTED kappa lambda mu nu xi omicron pi rho",
            "replacement",
        );
        let resolved = resolve(body, &operation, 0, None).unwrap();
        assert_eq!(resolved.confidence, 0.5);
    }

    #[test]
    fn empty_body_after_frontmatter_forces_insertion_at_fm_end() {
        let body = "---\ntitle: x\n---\n";
        let fm_end = body.len();
        let operation = op(OpType::InsertAfter, "anything not present", "new content");
        let resolved = resolve(body, &operation, fm_end, None).unwrap();
        assert_eq!(resolved.start, fm_end);
        assert_eq!(resolved.end, fm_end);
        assert_eq!(resolved.confidence, 0.7);
    }

    #[test]
    fn cursor_fallback_used_as_last_resort() {
        let body = "some unrelated content here";
        let operation = op(OpType::InsertAfter, "text nowhere in the body at all", "inserted");
        let resolved = resolve(body, &operation, 0, Some(10)).unwrap();
        assert_eq!(resolved.start, 10);
        assert_eq!(resolved.confidence, 0.3);
    }

    #[test]
    fn unresolvable_operation_is_dropped_not_panicked() {
        let body = "some unrelated content here";
        let operation = op(OpType::InsertAfter, "text nowhere in the body at all", "inserted");
        let err = resolve(body, &operation, 0, None);
        assert!(err.is_err());
    }

    #[test]
    fn resolutions_are_sorted_start_descending_for_sequential_application() {
        let body = "alpha beta gamma";
        let ops = vec![
            op(OpType::ReplaceRange, "alpha", "A"),
            op(OpType::ReplaceRange, "gamma", "G"),
        ];
        let batch = resolve_batch(body, ops, 0, None);
        assert_eq!(batch.dropped.len(), 0);
        assert!(batch.resolved[0].start > batch.resolved[1].start);
    }

    #[test]
    fn applying_a_resolved_batch_respects_descending_order() {
        let body = "alpha beta gamma";
        let ops = vec![op(OpType::ReplaceRange, "alpha", "A"), op(OpType::ReplaceRange, "gamma", "G")];
        let batch = resolve_batch(body, ops, 0, None);
        let applied = apply_resolved_edits(body, &batch.resolved);
        assert_eq!(applied, "A beta G");
    }

    #[test]
    fn frontmatter_intersecting_edit_is_clamped() {
        let body = "---\ntitle: x\n---\nbody text";
        let fm_end = 17;
        let mut operation = op(OpType::ReplaceRange, "title: x", "title: y");
        operation.start = Some(4);
        operation.end = Some(12);
        let resolved = resolve(body, &operation, fm_end, None).unwrap();
        assert!(resolved.start >= fm_end);
    }
}
