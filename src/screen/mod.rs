//! A fixed-grid character buffer with a scroll region, a bounded scrollback
//! ring, and a CSI interpreter covering the subset of ANSI sequences a shell
//! needs (cursor motion, erase, and 8+8 color SGR). This is a pure value
//! type: no locks, no I/O, single writer. Rendering it is the job of an
//! external display frontend; this module only maintains the model.

mod csi;

use std::collections::VecDeque;

pub const SCROLLBACK_LIMIT: usize = 1024;

/// RGB foreground color. The default is "no color" (terminal default, shown
/// here as white to match a typical light-on-dark terminal foreground).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const DEFAULT: Color = Color {
        r: 255,
        g: 255,
        b: 255,
    };

    const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Color { r, g, b }
    }
}

/// ANSI SGR foreground palette: codes 30-37 and their bright 90-97 variants.
fn palette_color(code: i64) -> Option<Color> {
    Some(match code {
        30 => Color::rgb(0, 0, 0),
        31 => Color::rgb(255, 0, 0),
        32 => Color::rgb(0, 255, 0),
        33 => Color::rgb(255, 255, 0),
        34 => Color::rgb(0, 0, 255),
        35 => Color::rgb(255, 0, 255),
        36 => Color::rgb(0, 255, 255),
        37 => Color::rgb(255, 255, 255),
        90 => Color::rgb(128, 128, 128),
        91 => Color::rgb(255, 128, 128),
        92 => Color::rgb(128, 255, 128),
        93 => Color::rgb(255, 255, 128),
        94 => Color::rgb(128, 128, 255),
        95 => Color::rgb(255, 128, 255),
        96 => Color::rgb(128, 255, 255),
        97 => Color::rgb(255, 255, 255),
        _ => return None,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cell {
    pub ch: char,
    pub fg: Color,
}

impl Default for Cell {
    fn default() -> Self {
        Cell {
            ch: ' ',
            fg: Color::DEFAULT,
        }
    }
}

pub struct ScreenBuffer {
    rows: usize,
    cols: usize,
    grid: Vec<Vec<Cell>>,
    cursor_row: usize,
    cursor_col: usize,
    scroll_top: usize,
    scroll_bottom: usize,
    scrollback: VecDeque<Vec<Cell>>,
    scrollback_offset: usize,
    current_fg: Color,
    parser: csi::Parser,
    pending_wrap: bool,
}

impl ScreenBuffer {
    pub fn new(rows: usize, cols: usize) -> Self {
        let rows = rows.max(1);
        let cols = cols.max(1);
        ScreenBuffer {
            rows,
            cols,
            grid: vec![vec![Cell::default(); cols]; rows],
            cursor_row: 0,
            cursor_col: 0,
            scroll_top: 0,
            scroll_bottom: rows - 1,
            scrollback: VecDeque::new(),
            scrollback_offset: 0,
            current_fg: Color::DEFAULT,
            parser: csi::Parser::new(),
            pending_wrap: false,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn cursor(&self) -> (usize, usize) {
        (self.cursor_row, self.cursor_col)
    }

    /// Feeds a chunk of raw PTY output into the buffer. Safe to call with
    /// arbitrarily-split chunks of the same logical stream: any in-progress
    /// escape sequence is carried in `self.parser` across calls.
    pub fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            match self.parser.feed(byte) {
                csi::Event::Pending => {}
                csi::Event::Plain(b) => self.write_plain_byte(b),
                csi::Event::Csi { final_byte, params } => self.apply_csi(final_byte, &params),
            }
        }
    }

    fn write_plain_byte(&mut self, byte: u8) {
        match byte {
            b'\n' => self.newline(),
            b'\r' => {
                self.cursor_col = 0;
                self.pending_wrap = false;
            }
            0x08 => {
                self.cursor_col = self.cursor_col.saturating_sub(1);
                self.pending_wrap = false;
            }
            b'\t' => {
                let next_stop = ((self.cursor_col / 8) + 1) * 8;
                if next_stop >= self.cols {
                    self.newline();
                } else {
                    self.cursor_col = next_stop;
                }
            }
            b if b >= 0x20 => self.write_printable(b as char),
            _ => {}
        }
    }

    fn write_printable(&mut self, ch: char) {
        if self.pending_wrap {
            self.newline();
            self.pending_wrap = false;
        }
        self.grid[self.cursor_row][self.cursor_col] = Cell {
            ch,
            fg: self.current_fg,
        };
        if self.cursor_col + 1 >= self.cols {
            // Cursor parks one past the end; the *next* printable byte wraps.
            self.cursor_col = self.cols - 1;
            self.pending_wrap = true;
        } else {
            self.cursor_col += 1;
        }
    }

    fn newline(&mut self) {
        self.pending_wrap = false;
        self.cursor_col = 0;
        if self.cursor_row == self.scroll_bottom {
            self.scroll_up();
        } else if self.cursor_row + 1 < self.rows {
            self.cursor_row += 1;
        }
    }

    fn scroll_up(&mut self) {
        let saved = self.grid[self.scroll_top].clone();
        self.scrollback.push_back(saved);
        while self.scrollback.len() > SCROLLBACK_LIMIT {
            self.scrollback.pop_front();
        }
        for row in self.scroll_top..self.scroll_bottom {
            self.grid[row] = self.grid[row + 1].clone();
        }
        self.grid[self.scroll_bottom] = vec![Cell::default(); self.cols];
    }

    fn apply_csi(&mut self, final_byte: char, params: &[i64]) {
        match final_byte {
            'A' => {
                let n = csi::param_or(params, 0, 1) as usize;
                self.cursor_row = self.cursor_row.saturating_sub(n);
            }
            'B' => {
                let n = csi::param_or(params, 0, 1) as usize;
                self.cursor_row = (self.cursor_row + n).min(self.rows - 1);
            }
            'C' => {
                let n = csi::param_or(params, 0, 1) as usize;
                self.cursor_col = (self.cursor_col + n).min(self.cols - 1);
                self.pending_wrap = false;
            }
            'D' => {
                let n = csi::param_or(params, 0, 1) as usize;
                self.cursor_col = self.cursor_col.saturating_sub(n);
                self.pending_wrap = false;
            }
            'H' | 'f' => {
                let row = csi::param_or(params, 0, 1) as usize;
                let col = csi::param_or(params, 1, 1) as usize;
                self.cursor_row = row.saturating_sub(1).min(self.rows - 1);
                self.cursor_col = col.saturating_sub(1).min(self.cols - 1);
                self.pending_wrap = false;
            }
            'J' => self.erase_display(csi::param_or(params, 0, 0)),
            'K' => self.erase_line(csi::param_or(params, 0, 0)),
            'm' => self.apply_sgr(params),
            _ => {}
        }
    }

    fn erase_display(&mut self, mode: i64) {
        match mode {
            0 => {
                self.clear_cells(self.cursor_row, self.cursor_col, self.rows - 1, self.cols - 1);
            }
            1 => {
                self.clear_cells(0, 0, self.cursor_row, self.cursor_col);
            }
            2 => {
                self.clear_cells(0, 0, self.rows - 1, self.cols - 1);
            }
            _ => {}
        }
    }

    fn erase_line(&mut self, mode: i64) {
        let row = self.cursor_row;
        match mode {
            0 => self.clear_cells(row, self.cursor_col, row, self.cols - 1),
            1 => self.clear_cells(row, 0, row, self.cursor_col),
            2 => self.clear_cells(row, 0, row, self.cols - 1),
            _ => {}
        }
    }

    fn clear_cells(&mut self, from_row: usize, from_col: usize, to_row: usize, to_col: usize) {
        for row in from_row..=to_row {
            let start = if row == from_row { from_col } else { 0 };
            let end = if row == to_row { to_col } else { self.cols - 1 };
            for col in start..=end {
                self.grid[row][col] = Cell::default();
            }
        }
    }

    fn apply_sgr(&mut self, params: &[i64]) {
        if params.is_empty() {
            self.current_fg = Color::DEFAULT;
            return;
        }
        for &code in params {
            if code == 0 {
                self.current_fg = Color::DEFAULT;
            } else if let Some(color) = palette_color(code) {
                self.current_fg = color;
            }
        }
    }

    /// Grows or shrinks the grid in place, preserving the overlapping
    /// top-left region and resetting the scroll region to the full screen.
    pub fn resize(&mut self, rows: usize, cols: usize) {
        let rows = rows.max(1);
        let cols = cols.max(1);
        let mut new_grid = vec![vec![Cell::default(); cols]; rows];
        for row in 0..rows.min(self.rows) {
            for col in 0..cols.min(self.cols) {
                new_grid[row][col] = self.grid[row][col];
            }
        }
        self.grid = new_grid;
        self.rows = rows;
        self.cols = cols;
        self.cursor_row = self.cursor_row.min(rows - 1);
        self.cursor_col = self.cursor_col.min(cols - 1);
        self.scroll_top = 0;
        self.scroll_bottom = rows - 1;
        self.pending_wrap = false;
    }

    pub fn set_scrollback_offset(&mut self, offset: usize) {
        self.scrollback_offset = offset.min(self.scrollback.len());
    }

    pub fn scrollback_len(&self) -> usize {
        self.scrollback.len()
    }

    /// Returns exactly `rows()` lines, each `cols()` cells wide, honoring
    /// the current scrollback offset.
    pub fn display_lines(&self) -> Vec<Vec<Cell>> {
        if self.scrollback_offset == 0 {
            return self.grid.clone();
        }
        let offset = self.scrollback_offset.min(self.rows);
        let sb_len = self.scrollback.len();
        let mut lines = Vec::with_capacity(self.rows);
        for i in 0..offset {
            let idx = sb_len - offset + i;
            lines.push(self.scrollback[idx].clone());
        }
        for row in 0..(self.rows - offset) {
            lines.push(self.grid[row].clone());
        }
        lines
    }

    /// Renders the visible grid as plain text, one line per row, trailing
    /// whitespace trimmed. Convenience for tests and simple consumers; a
    /// real display frontend should use `display_lines` for colors too.
    pub fn to_plain_text(&self) -> String {
        self.grid
            .iter()
            .map(|row| {
                row.iter()
                    .map(|cell| cell.ch)
                    .collect::<String>()
                    .trim_end()
                    .to_string()
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_stays_rectangular_after_writes() {
        let mut buf = ScreenBuffer::new(5, 10);
        buf.write(b"hello world this overflows the row\n\nmore text");
        assert_eq!(buf.rows(), 5);
        for row in buf.display_lines() {
            assert_eq!(row.len(), 10);
        }
        let (row, col) = buf.cursor();
        assert!(row < 5);
        assert!(col <= 10);
    }

    #[test]
    fn incremental_feed_matches_bulk_feed() {
        let stream = b"abc\x1b[31mdef\x1b[0mghi\r\nnext line";
        let mut bulk = ScreenBuffer::new(3, 20);
        bulk.write(stream);

        let mut incremental = ScreenBuffer::new(3, 20);
        for chunk in stream.chunks(3) {
            incremental.write(chunk);
        }

        assert_eq!(bulk.to_plain_text(), incremental.to_plain_text());
    }

    #[test]
    fn csi_coverage_scenario() {
        let mut buf = ScreenBuffer::new(2, 10);
        buf.write(b"A\x1b[31mB\x1b[0mC");
        let line = &buf.display_lines()[0];
        assert_eq!(line[0].ch, 'A');
        assert_eq!(line[0].fg, Color::DEFAULT);
        assert_eq!(line[1].ch, 'B');
        assert_eq!(line[1].fg, palette_color(31).unwrap());
        assert_eq!(line[2].ch, 'C');
        assert_eq!(line[2].fg, Color::DEFAULT);
    }

    #[test]
    fn cursor_home_with_no_params_goes_to_origin() {
        let mut buf = ScreenBuffer::new(5, 5);
        buf.write(b"\x1b[3;3H\x1b[H");
        assert_eq!(buf.cursor(), (0, 0));
    }

    #[test]
    fn erase_whole_display_clears_every_cell_but_keeps_cursor() {
        let mut buf = ScreenBuffer::new(2, 4);
        buf.write(b"abcd\x1b[3;2H\x1b[2J");
        assert_eq!(buf.cursor(), (1, 1));
        for line in buf.display_lines() {
            for cell in line {
                assert_eq!(cell.ch, ' ');
            }
        }
    }

    #[test]
    fn tab_at_last_column_triggers_newline() {
        let mut buf = ScreenBuffer::new(3, 8);
        buf.write(b"\x1b[1;8H\t");
        assert_eq!(buf.cursor(), (1, 0));
    }

    #[test]
    fn writing_exactly_cols_bytes_parks_cursor_one_past_end() {
        let mut buf = ScreenBuffer::new(2, 5);
        buf.write(b"abcde");
        assert_eq!(buf.cursor(), (0, 4));
        buf.write(b"f");
        assert_eq!(buf.cursor(), (1, 1));
        assert_eq!(buf.display_lines()[1][0].ch, 'f');
    }

    #[test]
    fn scrollback_length_is_bounded() {
        let mut buf = ScreenBuffer::new(2, 4);
        for _ in 0..(SCROLLBACK_LIMIT + 50) {
            buf.write(b"x\n");
        }
        assert!(buf.scrollback_len() <= SCROLLBACK_LIMIT);
    }

    #[test]
    fn resize_preserves_overlapping_region_and_drops_the_rest() {
        let mut buf = ScreenBuffer::new(24, 80);
        buf.write(b"0123456789012345678901234567890123456789");
        buf.resize(24, 40);
        assert_eq!(buf.cols(), 40);
        let line = &buf.display_lines()[0];
        assert_eq!(line[0].ch, '0');
        assert_eq!(line[39].ch, '9');
    }

    #[test]
    fn resize_is_idempotent_on_dimensions() {
        let mut buf = ScreenBuffer::new(24, 80);
        buf.resize(10, 40);
        buf.resize(10, 40);
        assert_eq!((buf.rows(), buf.cols()), (10, 40));
    }
}
