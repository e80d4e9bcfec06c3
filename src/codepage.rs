//! Decodes legacy single-byte text into UTF-8 strings.
//!
//! TopSpeed files predate Unicode; string fields carry whatever OEM or
//! Windows code page the producing application used.  The default is IBM
//! code page 437, which `encoding_rs` does not ship (it carries only the
//! WHATWG web encodings), so the 437 high half is a built-in table here.
//! Any other code page is resolved through `encoding_rs` by label.

#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error("Unknown code page label: {0}")]
    UnknownLabel(String),
}

/// The upper 128 entries of IBM code page 437.  The lower half is ASCII.
#[rustfmt::skip]
const CP437_HIGH: [char; 128] = [
    'Ç', 'ü', 'é', 'â', 'ä', 'à', 'å', 'ç', 'ê', 'ë', 'è', 'ï', 'î', 'ì', 'Ä', 'Å',
    'É', 'æ', 'Æ', 'ô', 'ö', 'ò', 'û', 'ù', 'ÿ', 'Ö', 'Ü', '¢', '£', '¥', '₧', 'ƒ',
    'á', 'í', 'ó', 'ú', 'ñ', 'Ñ', 'ª', 'º', '¿', '⌐', '¬', '½', '¼', '¡', '«', '»',
    '░', '▒', '▓', '│', '┤', '╡', '╢', '╖', '╕', '╣', '║', '╗', '╝', '╜', '╛', '┐',
    '└', '┴', '┬', '├', '─', '┼', '╞', '╟', '╚', '╔', '╩', '╦', '╠', '═', '╬', '╧',
    '╨', '╤', '╥', '╙', '╘', '╒', '╓', '╫', '╪', '┘', '┌', '█', '▄', '▌', '▐', '▀',
    'α', 'ß', 'Γ', 'π', 'Σ', 'σ', 'µ', 'τ', 'Φ', 'Θ', 'Ω', 'δ', '∞', 'φ', 'ε', '∩',
    '≡', '±', '≥', '≤', '⌠', '⌡', '÷', '≈', '°', '∙', '·', '√', 'ⁿ', '²', '■', '\u{00a0}',
];

/// A resolved text decoder for one code page.
#[derive(Debug, Clone, Copy)]
pub enum CodePage {
    Cp437,
    Other(&'static encoding_rs::Encoding),
}

impl CodePage {
    /// Resolves a code page from a configuration label such as `cp437` or
    /// `windows-1252`.
    pub fn from_label(label: &str) -> Result<CodePage, Error> {
        let normalized = label.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "cp437" | "ibm437" | "437" | "oem-us" => Ok(CodePage::Cp437),
            other => encoding_rs::Encoding::for_label(other.as_bytes())
                .map(CodePage::Other)
                .ok_or_else(|| Error::UnknownLabel(label.to_string())),
        }
    }

    /// Decodes bytes to a String, replacing undecodable sequences.
    pub fn decode(&self, bytes: &[u8]) -> String {
        match self {
            CodePage::Cp437 => bytes
                .iter()
                .map(|&b| {
                    if b < 0x80 {
                        b as char
                    } else {
                        CP437_HIGH[(b - 0x80) as usize]
                    }
                })
                .collect(),
            CodePage::Other(enc) => {
                let (cow, _, _) = enc.decode(bytes);
                cow.into_owned()
            }
        }
    }
}

impl Default for CodePage {
    fn default() -> Self {
        CodePage::Cp437
    }
}

#[test]
fn test_cp437_ascii_passthrough() {
    let cp = CodePage::Cp437;
    assert_eq!(cp.decode(b"FORCAST 99"), "FORCAST 99");
}

#[test]
fn test_cp437_high_half() {
    let cp = CodePage::Cp437;
    // 0x81 'ü', 0x82 'é', 0xE1 'ß'
    assert_eq!(cp.decode(&[0x81, 0x82, 0xe1]), "üéß");
}

#[test]
fn test_windows_1252_by_label() {
    let cp = CodePage::from_label("windows-1252").unwrap();
    // 0xE9 is 'é' in windows-1252.
    assert_eq!(cp.decode(&[0xe9]), "é");
}

#[test]
fn test_unknown_label_rejected() {
    assert!(CodePage::from_label("klingon-8").is_err());
}
