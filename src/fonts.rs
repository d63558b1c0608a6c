//! Font configuration: the one long-lived handle shared by every render.
//!
//! Discovery walks the platform font directories once at startup and records
//! each face's family, style and metrics using `ttf-parser`. File bytes are
//! read lazily the first time a face is actually used, then kept for the life
//! of the process. The PDF base-14 families are always available with
//! heuristic metrics, so a configuration never fails to resolve a font.

use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::{Lazy, OnceCell};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::error::BridgeError;

/// Base-14 families the PDF writer can use without embedding.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuiltinFamily {
    Helvetica,
    Times,
    Courier,
}

impl BuiltinFamily {
    /// Average advance as a fraction of the font size.
    fn average_advance(self, bold: bool) -> f32 {
        match (self, bold) {
            (BuiltinFamily::Helvetica, false) => 0.5,
            (BuiltinFamily::Helvetica, true) => 0.55,
            (BuiltinFamily::Times, false) => 0.45,
            (BuiltinFamily::Times, true) => 0.5,
            (BuiltinFamily::Courier, _) => 0.6,
        }
    }
}

/// A resolved font: either a builtin family or an index into the discovered
/// faces of the [`FontConfiguration`] that produced it.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum FontRef {
    Builtin {
        family: BuiltinFamily,
        bold: bool,
        italic: bool,
    },
    Face(usize),
}

impl FontRef {
    pub const DEFAULT: FontRef = FontRef::Builtin {
        family: BuiltinFamily::Helvetica,
        bold: false,
        italic: false,
    };
}

/// A discovered or explicitly loaded TTF/OTF face.
#[derive(Debug)]
pub struct FontFace {
    pub family: String,
    pub bold: bool,
    pub italic: bool,
    pub path: Option<PathBuf>,
    pub units_per_em: f32,
    pub ascender: f32,
    pub descender: f32,
    bytes: OnceCell<Vec<u8>>,
}

/// Platform font directories searched by [`FontConfiguration::discover`].
static SYSTEM_FONT_DIRS: Lazy<Vec<PathBuf>> = Lazy::new(|| {
    let mut dirs = Vec::new();
    if cfg!(target_os = "macos") {
        dirs.push(PathBuf::from("/System/Library/Fonts"));
        dirs.push(PathBuf::from("/Library/Fonts"));
    } else if cfg!(target_os = "windows") {
        dirs.push(PathBuf::from(r"C:\Windows\Fonts"));
    } else {
        dirs.push(PathBuf::from("/usr/share/fonts"));
        dirs.push(PathBuf::from("/usr/local/share/fonts"));
    }
    if let Some(home) = std::env::var_os("HOME").map(PathBuf::from) {
        if cfg!(target_os = "macos") {
            dirs.push(home.join("Library/Fonts"));
        } else {
            dirs.push(home.join(".local/share/fonts"));
            dirs.push(home.join(".fonts"));
        }
    }
    dirs
});

/// Cached font configuration. Immutable after construction apart from the
/// per-face lazily loaded bytes.
#[derive(Debug, Default)]
pub struct FontConfiguration {
    faces: Vec<FontFace>,
}

impl FontConfiguration {
    /// Only the builtin families. Deterministic, no filesystem access.
    pub fn builtin() -> Self {
        Self::default()
    }

    /// Builtin families plus every face found in the platform font directories.
    pub fn discover() -> Self {
        Self::from_dirs(SYSTEM_FONT_DIRS.iter())
    }

    /// Builtin families plus every face found under `dirs`.
    pub fn from_dirs<I, P>(dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut config = Self::builtin();
        for dir in dirs {
            let dir = dir.as_ref();
            if !dir.is_dir() {
                continue;
            }
            for entry in WalkDir::new(dir)
                .follow_links(true)
                .sort_by_file_name()
                .into_iter()
                .flatten()
            {
                let path = entry.path();
                if !entry.file_type().is_file() || !is_font_file(path) {
                    continue;
                }
                if let Err(e) = config.index_file(path) {
                    log::warn!("Skipping font: {e}");
                }
            }
        }
        log::info!("Font configuration ready ({} faces)", config.faces.len());
        config
    }

    fn index_file(&mut self, path: &Path) -> Result<usize, BridgeError> {
        let bytes = fs::read(path)?;
        let mut face = parse_face(&bytes, Some(path))?;
        // Metrics are recorded now; bytes are re-read on first use.
        face.path = Some(path.to_path_buf());
        self.faces.push(face);
        Ok(self.faces.len() - 1)
    }

    /// Register one face from memory. Returns its index.
    pub fn load_font(&mut self, bytes: Vec<u8>) -> Result<usize, BridgeError> {
        let face = parse_face(&bytes, None)?;
        // The cell is fresh, so this cannot fail.
        let _ = face.bytes.set(bytes);
        self.faces.push(face);
        Ok(self.faces.len() - 1)
    }

    /// Number of discovered or loaded faces (builtins excluded).
    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    /// Resolve a CSS `font-family` list to a concrete font.
    pub fn resolve(&self, families: &[String], bold: bool, italic: bool) -> FontRef {
        for name in families {
            let name = name.trim().trim_matches(|c| c == '"' || c == '\'');
            if let Some(index) = self.find_face(name, bold, italic) {
                return FontRef::Face(index);
            }
            if let Some(family) = builtin_alias(name) {
                return FontRef::Builtin {
                    family,
                    bold,
                    italic,
                };
            }
        }
        FontRef::Builtin {
            family: BuiltinFamily::Helvetica,
            bold,
            italic,
        }
    }

    /// Pick the face of `family` whose style matches best: exact first, then
    /// same weight, then anything in the family.
    fn find_face(&self, family: &str, bold: bool, italic: bool) -> Option<usize> {
        let mut best: Option<(u8, usize)> = None;
        for (index, face) in self.faces.iter().enumerate() {
            if !face.family.eq_ignore_ascii_case(family) {
                continue;
            }
            let score = u8::from(face.bold == bold) * 2 + u8::from(face.italic == italic);
            if best.map_or(true, |(s, _)| score > s) {
                best = Some((score, index));
            }
        }
        best.map(|(_, index)| index)
    }

    /// Raw bytes of a face, loading them on first use.
    pub fn face_bytes(&self, index: usize) -> Option<&[u8]> {
        let face = self.faces.get(index)?;
        let bytes = face.bytes.get_or_try_init(|| match &face.path {
            Some(path) => fs::read(path),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "font has no backing file",
            )),
        });
        match bytes {
            Ok(b) => Some(b.as_slice()),
            Err(e) => {
                log::warn!("Font '{}' unavailable: {e}", face.family);
                None
            }
        }
    }

    /// Width of `text` at `font_size` in points.
    ///
    /// Discovered faces sum real glyph advances; builtins use an average
    /// advance per character.
    pub fn measure_text_width(&self, text: &str, font_size: f32, font: &FontRef) -> f32 {
        let heuristic = |family: BuiltinFamily, bold: bool| {
            text.chars().count() as f32 * font_size * family.average_advance(bold)
        };
        match font {
            FontRef::Builtin { family, bold, .. } => heuristic(*family, *bold),
            FontRef::Face(index) => {
                let parsed = self
                    .face_bytes(*index)
                    .and_then(|bytes| ttf_parser::Face::parse(bytes, 0).ok());
                let Some(face) = parsed else {
                    return heuristic(BuiltinFamily::Helvetica, false);
                };
                let scale = font_size / face.units_per_em() as f32;
                text.chars()
                    .map(|ch| match face.glyph_index(ch) {
                        Some(gid) => face.glyph_hor_advance(gid).unwrap_or(0) as f32 * scale,
                        None => font_size * 0.5,
                    })
                    .sum()
            }
        }
    }

    /// Distance from the top of a line box to the baseline.
    pub fn ascender(&self, font_size: f32, font: &FontRef) -> f32 {
        match font {
            FontRef::Face(index) => match self.faces.get(*index) {
                Some(face) => face.ascender * font_size / face.units_per_em,
                None => font_size * 0.75,
            },
            FontRef::Builtin { .. } => font_size * 0.75,
        }
    }

    /// Greedy word-wrap of `text` into lines no wider than `max_width`.
    ///
    /// Existing newlines are kept; a word wider than a whole line is split
    /// between characters.
    pub fn wrap_text(&self, text: &str, font_size: f32, font: &FontRef, max_width: f32) -> Vec<String> {
        if max_width <= 0.0 || text.is_empty() {
            return vec![text.to_string()];
        }

        let mut lines = Vec::new();
        for paragraph in text.split('\n') {
            let mut current = String::new();
            for word in paragraph.split_whitespace() {
                let candidate = if current.is_empty() {
                    word.to_string()
                } else {
                    format!("{current} {word}")
                };
                if self.measure_text_width(&candidate, font_size, font) <= max_width {
                    current = candidate;
                    continue;
                }
                if !current.is_empty() {
                    lines.push(std::mem::take(&mut current));
                }
                // Hard-break words that cannot fit on a line of their own.
                for ch in word.chars() {
                    current.push(ch);
                    if current.chars().count() > 1
                        && self.measure_text_width(&current, font_size, font) > max_width
                    {
                        current.pop();
                        lines.push(std::mem::take(&mut current));
                        current.push(ch);
                    }
                }
            }
            lines.push(current);
        }
        lines
    }
}

fn is_font_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("ttf") || e.eq_ignore_ascii_case("otf"))
        .unwrap_or(false)
}

fn parse_face(bytes: &[u8], path: Option<&Path>) -> Result<FontFace, BridgeError> {
    let font_error = |detail: String| BridgeError::Font {
        path: path.map(Path::to_path_buf).unwrap_or_default(),
        detail,
    };
    let face = ttf_parser::Face::parse(bytes, 0).map_err(|e| font_error(e.to_string()))?;

    let family = family_name(&face)
        .or_else(|| {
            path.and_then(|p| p.file_stem())
                .and_then(|s| s.to_str())
                .map(str::to_string)
        })
        .ok_or_else(|| font_error("font has no family name".to_string()))?;

    Ok(FontFace {
        family,
        bold: face.is_bold(),
        italic: face.is_italic(),
        path: None,
        units_per_em: face.units_per_em() as f32,
        ascender: face.ascender() as f32,
        descender: face.descender() as f32,
        bytes: OnceCell::new(),
    })
}

fn family_name(face: &ttf_parser::Face<'_>) -> Option<String> {
    let lookup = |id: u16| {
        face.names()
            .into_iter()
            .filter(|n| n.name_id == id)
            .find_map(|n| n.to_string())
    };
    lookup(ttf_parser::name_id::TYPOGRAPHIC_FAMILY).or_else(|| lookup(ttf_parser::name_id::FAMILY))
}

/// Generic CSS families and the common names of the base-14 fonts.
fn builtin_alias(name: &str) -> Option<BuiltinFamily> {
    match name.to_ascii_lowercase().as_str() {
        "sans-serif" | "helvetica" | "arial" | "system-ui" => Some(BuiltinFamily::Helvetica),
        "serif" | "times" | "times new roman" | "times-roman" => Some(BuiltinFamily::Times),
        "monospace" | "courier" | "courier new" => Some(BuiltinFamily::Courier),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn families(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn heuristic_text_width() {
        let fonts = FontConfiguration::builtin();
        let w = fonts.measure_text_width("Hello", 16.0, &FontRef::DEFAULT);
        // 5 chars × 16 × 0.5 = 40
        assert!((w - 40.0).abs() < 0.1);
    }

    #[test]
    fn courier_is_fixed_pitch() {
        let fonts = FontConfiguration::builtin();
        let mono = fonts.resolve(&families(&["monospace"]), true, false);
        let w = fonts.measure_text_width("abc", 10.0, &mono);
        assert!((w - 18.0).abs() < 0.01);
    }

    #[test]
    fn resolve_walks_family_list() {
        let fonts = FontConfiguration::builtin();
        let font = fonts.resolve(&families(&["'No Such Font'", "serif"]), false, true);
        assert_eq!(
            font,
            FontRef::Builtin {
                family: BuiltinFamily::Times,
                bold: false,
                italic: true
            }
        );
    }

    #[test]
    fn unknown_family_falls_back_to_helvetica() {
        let fonts = FontConfiguration::builtin();
        assert_eq!(fonts.resolve(&families(&["Nope"]), false, false), FontRef::DEFAULT);
        assert_eq!(fonts.resolve(&[], false, false), FontRef::DEFAULT);
    }

    #[test]
    fn load_font_rejects_garbage() {
        let mut fonts = FontConfiguration::builtin();
        let err = fonts.load_font(b"not a font".to_vec()).unwrap_err();
        assert!(matches!(err, BridgeError::Font { .. }));
        assert_eq!(fonts.face_count(), 0);
    }

    #[test]
    fn missing_dirs_yield_builtins_only() {
        let fonts = FontConfiguration::from_dirs(["/definitely/not/a/font/dir"]);
        assert_eq!(fonts.face_count(), 0);
        assert!((fonts.ascender(20.0, &FontRef::DEFAULT) - 15.0).abs() < 0.01);
    }

    #[test]
    fn wrap_text_breaks_on_width() {
        let fonts = FontConfiguration::builtin();
        // 10pt Helvetica: 5pt per char, so 30pt holds six characters.
        let lines = fonts.wrap_text("aa bb cc dd", 10.0, &FontRef::DEFAULT, 30.0);
        assert_eq!(lines, vec!["aa bb", "cc dd"]);
    }

    #[test]
    fn wrap_text_splits_overlong_words() {
        let fonts = FontConfiguration::builtin();
        let lines = fonts.wrap_text("abcdefgh", 10.0, &FontRef::DEFAULT, 20.0);
        assert_eq!(lines, vec!["abcd", "efgh"]);
    }
}
