//! Grid layout engine.
//!
//! Sessions are arranged as rows of cells. Every row carries a height share
//! and every cell a width share; within a row the widths sum to 100 and
//! across the layout the heights sum to 100. Structural edits (add, remove,
//! move) keep those sums and never leave an empty row behind.
//!
//! Freshly inserted rows and cells carry [`Share::Pending`]. On
//! [`LayoutEngine::normalize`], a pending share resets its whole group to
//! equal shares; otherwise the group is rescaled proportionally so the
//! user's chosen sizes survive later edits.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use protocol::SessionId;

/// Tolerance under which a share total counts as exactly 100.
const SUM_EPSILON: f64 = 1e-9;

/// Full extent of a row or column, in percent.
pub const FULL_SHARE: f64 = 100.0;

/// Errors from layout operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LayoutError {
    /// The session has no cell in the layout.
    #[error("session {0} is not in the layout")]
    UnknownSession(SessionId),

    /// The referenced row does not exist.
    #[error("row {0} does not exist")]
    UnknownRow(RowId),

    /// The referenced cell is not in the target row.
    #[error("session {0} is not in the target row")]
    UnknownCell(SessionId),

    /// A cell cannot be dropped next to itself.
    #[error("cannot drop a cell next to itself")]
    SelfTarget,
}

/// Stable row identifier, never reused within one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowId(u64);

impl RowId {
    /// Raw numeric value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "row-{}", self.0)
    }
}

/// A row height or cell width.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Share {
    /// Just inserted; the next normalization gives its group equal shares.
    Pending,
    /// Percentage of the parent extent.
    Percent(f64),
}

impl Share {
    /// Percentage value, `0.0` while pending.
    pub fn percent(self) -> f64 {
        match self {
            Share::Pending => 0.0,
            Share::Percent(p) => p,
        }
    }

    /// Whether this share still awaits redistribution.
    pub fn is_pending(self) -> bool {
        matches!(self, Share::Pending)
    }
}

/// One session's slot within a row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cell {
    session_id: SessionId,
    width: Share,
}

impl Cell {
    fn new(session_id: SessionId, width: Share) -> Self {
        Self { session_id, width }
    }

    /// Session shown in this cell.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Width share within the row.
    pub fn width(&self) -> Share {
        self.width
    }
}

/// A horizontal band of cells.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Row {
    id: RowId,
    cells: Vec<Cell>,
    height: Share,
}

impl Row {
    /// Stable identifier.
    pub fn id(&self) -> RowId {
        self.id
    }

    /// Cells, left to right.
    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    /// Height share within the layout.
    pub fn height(&self) -> Share {
        self.height
    }

    fn position(&self, session_id: &str) -> Option<usize> {
        self.cells.iter().position(|c| c.session_id == session_id)
    }

    fn equalize_widths(&mut self) {
        let width = FULL_SHARE / self.cells.len() as f64;
        for cell in &mut self.cells {
            cell.width = Share::Percent(width);
        }
    }
}

/// Rows of cells, top to bottom.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridLayout {
    rows: Vec<Row>,
}

impl GridLayout {
    /// Rows, top to bottom.
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Looks up a row by id.
    pub fn row(&self, id: RowId) -> Option<&Row> {
        self.rows.iter().find(|r| r.id == id)
    }

    /// Row and cell index of a session.
    pub fn position(&self, session_id: &str) -> Option<(usize, usize)> {
        self.rows
            .iter()
            .enumerate()
            .find_map(|(r, row)| row.position(session_id).map(|c| (r, c)))
    }

    /// Whether a session has a cell.
    pub fn contains(&self, session_id: &str) -> bool {
        self.position(session_id).is_some()
    }

    /// Every session id, row-major.
    pub fn session_ids(&self) -> impl Iterator<Item = &str> {
        self.rows
            .iter()
            .flat_map(|r| r.cells.iter().map(|c| c.session_id.as_str()))
    }

    /// Number of cells.
    pub fn cell_count(&self) -> usize {
        self.rows.iter().map(|r| r.cells.len()).sum()
    }

    fn row_index(&self, id: RowId) -> Option<usize> {
        self.rows.iter().position(|r| r.id == id)
    }

    fn equalize_heights(&mut self) {
        let height = FULL_SHARE / self.rows.len() as f64;
        for row in &mut self.rows {
            row.height = Share::Percent(height);
        }
    }

    fn drop_empty_rows(&mut self) {
        self.rows.retain(|r| !r.cells.is_empty());
    }

    fn normalize(&mut self) {
        if normalize_shares(self.rows.iter_mut().map(|r| &mut r.height)) {
            self.equalize_heights();
        }
        for row in &mut self.rows {
            if normalize_shares(row.cells.iter_mut().map(|c| &mut c.width)) {
                row.equalize_widths();
            }
        }
    }
}

/// Rescales a group of shares to sum to 100.
///
/// Returns `true` when the group must be reset to equal shares instead: a
/// share is pending, or the total is not a positive finite number.
fn normalize_shares<'a>(shares: impl Iterator<Item = &'a mut Share>) -> bool {
    let mut shares: Vec<&mut Share> = shares.collect();
    if shares.is_empty() {
        return false;
    }
    if shares.iter().any(|s| s.is_pending()) {
        return true;
    }

    let total: f64 = shares.iter().map(|s| s.percent()).sum();
    if !total.is_finite() || total <= 0.0 {
        return true;
    }
    if (total - FULL_SHARE).abs() > SUM_EPSILON {
        for share in shares.iter_mut() {
            **share = Share::Percent(share.percent() / total * FULL_SHARE);
        }
    }
    false
}

/// Where a dragged cell would land.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DropTarget {
    /// Left of `session` in `row`.
    Before { row: RowId, session: SessionId },
    /// Right of `session` in `row`.
    After { row: RowId, session: SessionId },
    /// A new full-width row directly above `row`.
    NewRowAbove { row: RowId },
    /// A new full-width row directly below `row`.
    NewRowBelow { row: RowId },
}

impl DropTarget {
    /// Row the target is relative to.
    pub fn row(&self) -> RowId {
        match self {
            DropTarget::Before { row, .. }
            | DropTarget::After { row, .. }
            | DropTarget::NewRowAbove { row }
            | DropTarget::NewRowBelow { row } => *row,
        }
    }
}

/// Transient pointer-drag state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DragState {
    /// Whether a drag is in progress.
    pub active: bool,
    /// Session being dragged.
    pub source: Option<SessionId>,
    /// Current drop candidate.
    pub target: Option<DropTarget>,
}

/// Owns the (possibly absent) layout and the drag state.
#[derive(Debug, Clone, Default)]
pub struct LayoutEngine {
    layout: Option<GridLayout>,
    drag: DragState,
    next_row: u64,
}

impl LayoutEngine {
    /// An engine with no layout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current layout, `None` when no session is shown.
    pub fn layout(&self) -> Option<&GridLayout> {
        self.layout.as_ref()
    }

    /// Current drag state.
    pub fn drag(&self) -> &DragState {
        &self.drag
    }

    fn fresh_row_id(&mut self) -> RowId {
        self.next_row += 1;
        RowId(self.next_row)
    }

    fn single_row(&mut self, cells: Vec<Cell>) -> GridLayout {
        GridLayout {
            rows: vec![Row {
                id: self.fresh_row_id(),
                cells,
                height: Share::Percent(FULL_SHARE),
            }],
        }
    }

    /// Replaces the layout with one row holding one equal cell per id.
    ///
    /// Duplicate ids are ignored; an empty list clears the layout.
    pub fn initialize_layout<S: AsRef<str>>(&mut self, session_ids: &[S]) {
        let mut cells: Vec<Cell> = Vec::with_capacity(session_ids.len());
        for id in session_ids {
            let id = id.as_ref();
            if !cells.iter().any(|c| c.session_id == id) {
                cells.push(Cell::new(id.to_string(), Share::Pending));
            }
        }

        if cells.is_empty() {
            self.layout = None;
            return;
        }

        let mut layout = self.single_row(cells);
        layout.rows[0].equalize_widths();
        self.layout = Some(layout);
    }

    /// Adds a cell for `session_id` to the first row.
    pub fn add_cell(&mut self, session_id: &str) {
        match self.layout.as_mut() {
            None => {
                let layout = self.single_row(vec![Cell::new(
                    session_id.to_string(),
                    Share::Percent(FULL_SHARE),
                )]);
                self.layout = Some(layout);
            }
            Some(layout) => {
                if layout.contains(session_id) {
                    tracing::debug!(session_id = %session_id, "Cell already present");
                    return;
                }
                let first = &mut layout.rows[0];
                first
                    .cells
                    .push(Cell::new(session_id.to_string(), Share::Pending));
                first.equalize_widths();
            }
        }
    }

    /// Removes the cell for `session_id`; unknown ids are ignored.
    pub fn remove_cell(&mut self, session_id: &str) {
        let Some(layout) = self.layout.as_mut() else {
            return;
        };
        let Some((r, c)) = layout.position(session_id) else {
            return;
        };

        let row = &mut layout.rows[r];
        row.cells.remove(c);
        if !row.cells.is_empty() {
            row.equalize_widths();
            return;
        }

        layout.rows.remove(r);
        if layout.rows.is_empty() {
            self.layout = None;
        } else {
            layout.equalize_heights();
        }
    }

    /// Moves a cell to `target`, then normalizes.
    ///
    /// On error the layout is left exactly as it was.
    pub fn move_cell(&mut self, session_id: &str, target: &DropTarget) -> Result<(), LayoutError> {
        let unknown = || LayoutError::UnknownSession(session_id.to_string());
        let mut layout = self.layout.clone().ok_or_else(unknown)?;
        let (r, c) = layout.position(session_id).ok_or_else(unknown)?;

        let moving = layout.rows[r].cells.remove(c);

        // Empty rows are only dropped after insertion, so the source row can
        // still serve as the reference row.
        let target_row = layout
            .row_index(target.row())
            .ok_or(LayoutError::UnknownRow(target.row()))?;

        match target {
            DropTarget::NewRowAbove { .. } | DropTarget::NewRowBelow { .. } => {
                let row = Row {
                    id: self.fresh_row_id(),
                    cells: vec![Cell::new(moving.session_id, Share::Percent(FULL_SHARE))],
                    height: Share::Pending,
                };
                let at = match target {
                    DropTarget::NewRowAbove { .. } => target_row,
                    _ => target_row + 1,
                };
                layout.rows.insert(at, row);
            }
            DropTarget::Before { session, .. } | DropTarget::After { session, .. } => {
                if session == session_id {
                    return Err(LayoutError::SelfTarget);
                }
                let row = &mut layout.rows[target_row];
                let anchor = row
                    .position(session)
                    .ok_or_else(|| LayoutError::UnknownCell(session.clone()))?;
                let at = match target {
                    DropTarget::Before { .. } => anchor,
                    _ => anchor + 1,
                };
                row.cells
                    .insert(at, Cell::new(moving.session_id, Share::Pending));
            }
        }

        layout.drop_empty_rows();
        layout.normalize();
        self.layout = Some(layout);
        Ok(())
    }

    /// Makes every share group sum to 100.
    pub fn normalize(&mut self) {
        if let Some(layout) = self.layout.as_mut() {
            layout.drop_empty_rows();
            if layout.rows.is_empty() {
                self.layout = None;
            } else {
                layout.normalize();
            }
        }
    }

    /// Overwrites row heights positionally.
    ///
    /// Extra values are ignored; negative or non-finite values leave their
    /// row unchanged.
    pub fn update_row_sizes(&mut self, sizes: &[f64]) {
        let Some(layout) = self.layout.as_mut() else {
            return;
        };
        for (row, &size) in layout.rows.iter_mut().zip(sizes) {
            if size.is_finite() && size >= 0.0 {
                row.height = Share::Percent(size);
            }
        }
    }

    /// Overwrites the cell widths of one row positionally.
    ///
    /// Returns `false` if the row does not exist.
    pub fn update_cell_sizes(&mut self, row_id: RowId, sizes: &[f64]) -> bool {
        let Some(row) = self
            .layout
            .as_mut()
            .and_then(|l| l.rows.iter_mut().find(|r| r.id == row_id))
        else {
            return false;
        };
        for (cell, &size) in row.cells.iter_mut().zip(sizes) {
            if size.is_finite() && size >= 0.0 {
                cell.width = Share::Percent(size);
            }
        }
        true
    }

    /// Begins dragging `session_id`.
    pub fn start_drag(&mut self, session_id: &str) {
        self.drag = DragState {
            active: true,
            source: Some(session_id.to_string()),
            target: None,
        };
    }

    /// Updates the drop candidate as the pointer moves.
    pub fn set_drop_target(&mut self, target: Option<DropTarget>) {
        self.drag.target = target;
    }

    /// Finishes the drag, committing the move if a target is set.
    ///
    /// Returns whether the layout changed. The drag state is always cleared.
    pub fn end_drag(&mut self) -> bool {
        let drag = std::mem::take(&mut self.drag);
        let (true, Some(source), Some(target)) = (drag.active, drag.source, drag.target) else {
            return false;
        };

        match self.move_cell(&source, &target) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(session_id = %source, error = %e, "Drop rejected");
                false
            }
        }
    }

    /// Abandons the drag without moving anything.
    pub fn cancel_drag(&mut self) {
        self.drag = DragState::default();
    }
}
