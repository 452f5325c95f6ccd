//! Cell edit session
//!
//! Per-grid state machine for the one cell being edited:
//!
//! ```text
//! Viewing -> Editing -> Committing -> Viewing
//!                    \-> Cancelled  -> Viewing
//! ```
//!
//! The session never talks to persistence. `commit` and `choose_option` hand
//! back a `CommitRequest` for the engine to run through the mutation applier;
//! `cancel` hands back the pre-edit snapshot and nothing is written.

use gridsync_api::{CatalogEntry, ColumnId, GridError, RowId};
use gridsync_core::{CellValue, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CellRef {
    pub row_id: RowId,
    pub column: ColumnId,
}

impl CellRef {
    pub fn new(row_id: impl Into<RowId>, column: impl Into<ColumnId>) -> Self {
        Self {
            row_id: row_id.into(),
            column: column.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }
}

/// Where to open a dropdown editor, given the edited cell's rect.
pub trait OverlayPlacement: Send + Sync {
    fn place(&self, anchor: Rect, viewport: Rect) -> Rect;
}

/// Opens below the cell, flips above when the viewport has no room, and
/// stays horizontally inside the viewport.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BelowAnchor {
    pub height: f32,
}

impl Default for BelowAnchor {
    fn default() -> Self {
        Self { height: 240.0 }
    }
}

impl OverlayPlacement for BelowAnchor {
    fn place(&self, anchor: Rect, viewport: Rect) -> Rect {
        let width = anchor.width.min(viewport.width);
        let height = self.height.min(viewport.height);
        let max_x = viewport.right() - width;
        let x = anchor.x.min(max_x).max(viewport.x);

        let y = if anchor.bottom() + height <= viewport.bottom() {
            anchor.bottom()
        } else if anchor.y - height >= viewport.y {
            anchor.y - height
        } else {
            (viewport.bottom() - height).max(viewport.y)
        };
        Rect::new(x, y, width, height)
    }
}

/// The cell rect an overlay is anchored to and the visible area around it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlayAnchor {
    pub anchor: Rect,
    pub viewport: Rect,
}

/// Dropdown shown while a select cell is being edited.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectOverlay {
    pub options: Vec<CatalogEntry>,
    pub position: Option<Rect>,
}

impl SelectOverlay {
    pub fn new(options: Vec<CatalogEntry>) -> Self {
        Self {
            options,
            position: None,
        }
    }

    pub fn placed(mut self, placement: &dyn OverlayPlacement, at: Option<OverlayAnchor>) -> Self {
        self.position = at.map(|at| placement.place(at.anchor, at.viewport));
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EditState {
    Viewing,
    Editing {
        cell: CellRef,
        snapshot: CellValue,
        draft: CellValue,
        overlay: Option<SelectOverlay>,
    },
    Committing {
        cell: CellRef,
        value: CellValue,
    },
    Cancelled {
        cell: CellRef,
        snapshot: CellValue,
    },
}

/// A value the session wants written.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitRequest {
    pub cell: CellRef,
    pub value: CellValue,
}

fn not_editing(action: &str) -> GridError {
    GridError::EditSession {
        message: format!("cannot {} while no cell is being edited", action),
    }
}

#[derive(Debug)]
pub struct EditSession {
    state: EditState,
}

impl Default for EditSession {
    fn default() -> Self {
        Self::new()
    }
}

impl EditSession {
    pub fn new() -> Self {
        Self {
            state: EditState::Viewing,
        }
    }

    pub fn state(&self) -> &EditState {
        &self.state
    }

    pub fn editing_cell(&self) -> Option<&CellRef> {
        match &self.state {
            EditState::Editing { cell, .. } => Some(cell),
            _ => None,
        }
    }

    /// Start editing `cell`.
    ///
    /// Activating another cell while one is being edited blurs the first,
    /// which commits it; that commit is returned.
    pub fn begin(
        &mut self,
        cell: CellRef,
        current: CellValue,
        overlay: Option<SelectOverlay>,
    ) -> Option<CommitRequest> {
        if self.editing_cell() == Some(&cell) {
            return None;
        }
        let blurred = if self.editing_cell().is_some() {
            self.commit().ok().flatten()
        } else {
            None
        };
        self.state = EditState::Editing {
            cell,
            snapshot: current.clone(),
            draft: current,
            overlay,
        };
        blurred
    }

    pub fn set_draft(&mut self, value: CellValue) -> Result<()> {
        match &mut self.state {
            EditState::Editing { draft, .. } => {
                *draft = value;
                Ok(())
            }
            _ => Err(not_editing("change the draft")),
        }
    }

    /// Pick an option from the select overlay. Moves straight to `Committing`.
    pub fn choose_option(&mut self, id: Option<i64>) -> Result<CommitRequest> {
        let cell = match &self.state {
            EditState::Editing {
                cell,
                overlay: Some(_),
                ..
            } => cell.clone(),
            EditState::Editing { .. } => {
                return Err(GridError::EditSession {
                    message: "the edited cell has no options".to_string(),
                })
            }
            _ => return Err(not_editing("choose an option")),
        };
        let value = CellValue::Select(id);
        self.state = EditState::Committing {
            cell: cell.clone(),
            value: value.clone(),
        };
        Ok(CommitRequest { cell, value })
    }

    /// Blur or Enter. An unchanged draft goes straight back to `Viewing`.
    pub fn commit(&mut self) -> Result<Option<CommitRequest>> {
        let state = std::mem::replace(&mut self.state, EditState::Viewing);
        match state {
            EditState::Editing {
                cell,
                snapshot,
                draft,
                ..
            } => {
                if draft == snapshot {
                    return Ok(None);
                }
                self.state = EditState::Committing {
                    cell: cell.clone(),
                    value: draft.clone(),
                };
                Ok(Some(CommitRequest { cell, value: draft }))
            }
            other => {
                self.state = other;
                Err(not_editing("commit"))
            }
        }
    }

    /// Escape. Returns the pre-edit value; nothing is persisted.
    pub fn cancel(&mut self) -> Result<CellValue> {
        let state = std::mem::replace(&mut self.state, EditState::Viewing);
        match state {
            EditState::Editing { cell, snapshot, .. } => {
                self.state = EditState::Cancelled {
                    cell,
                    snapshot: snapshot.clone(),
                };
                Ok(snapshot)
            }
            other => {
                self.state = other;
                Err(not_editing("cancel"))
            }
        }
    }

    /// Leave `Committing` or `Cancelled` for `cell`. A session that has
    /// moved on to another cell is left alone.
    pub fn finish(&mut self, cell: &CellRef) {
        match &self.state {
            EditState::Committing { cell: current, .. } | EditState::Cancelled { cell: current, .. }
                if current == cell =>
            {
                self.state = EditState::Viewing;
            }
            _ => {}
        }
    }
}
