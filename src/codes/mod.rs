//! G/M/T-code data model.
//!
//! A [`Code`] is one parsed line of G-code: its originating [`Channel`],
//! type, major/minor numbers, parameters, and (for flow-control lines) the
//! keyword and its argument. Codes are created by the line parser
//! ([`parser::parse_line`]), by IPC clients, or synthesized internally.

mod parser;

pub use parser::parse_line;

use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Logical originator of a code. Each channel has its own code queue,
/// macro stack and firmware-side busy bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Channel {
    #[serde(rename = "HTTP")]
    Http,
    Telnet,
    File,
    #[serde(rename = "USB")]
    Usb,
    Aux,
    Trigger,
    Queue,
    #[serde(rename = "LCD")]
    Lcd,
    #[serde(rename = "SBC")]
    Sbc,
    Daemon,
    Autopause,
    File2,
    Queue2,
    Unknown,
}

impl Channel {
    pub const COUNT: usize = 14;

    pub const ALL: [Channel; Self::COUNT] = [
        Channel::Http,
        Channel::Telnet,
        Channel::File,
        Channel::Usb,
        Channel::Aux,
        Channel::Trigger,
        Channel::Queue,
        Channel::Lcd,
        Channel::Sbc,
        Channel::Daemon,
        Channel::Autopause,
        Channel::File2,
        Channel::Queue2,
        Channel::Unknown,
    ];

    pub fn index(self) -> usize {
        Self::ALL.iter().position(|c| *c == self).unwrap_or(Self::COUNT - 1)
    }

    /// Bit of this channel in a channel bitmask (busy mask, reply routing).
    pub fn bit(self) -> u16 {
        1 << self.index()
    }

    pub fn from_index(index: u8) -> Option<Channel> {
        Self::ALL.get(index as usize).copied()
    }
}

impl Default for Channel {
    fn default() -> Self {
        Channel::Unknown
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Channel::Http => "HTTP",
            Channel::Telnet => "Telnet",
            Channel::File => "File",
            Channel::Usb => "USB",
            Channel::Aux => "Aux",
            Channel::Trigger => "Trigger",
            Channel::Queue => "Queue",
            Channel::Lcd => "LCD",
            Channel::Sbc => "SBC",
            Channel::Daemon => "Daemon",
            Channel::Autopause => "Autopause",
            Channel::File2 => "File2",
            Channel::Queue2 => "Queue2",
            Channel::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CodeType {
    #[default]
    None,
    Comment,
    Keyword,
    G,
    M,
    T,
}

/// Flow-control keywords understood by the file interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Keyword {
    If,
    ElseIf,
    Else,
    While,
    Break,
    Continue,
    Abort,
    Var,
    Global,
    Set,
    Echo,
    Return,
}

impl Keyword {
    pub fn as_str(self) -> &'static str {
        match self {
            Keyword::If => "if",
            Keyword::ElseIf => "elif",
            Keyword::Else => "else",
            Keyword::While => "while",
            Keyword::Break => "break",
            Keyword::Continue => "continue",
            Keyword::Abort => "abort",
            Keyword::Var => "var",
            Keyword::Global => "global",
            Keyword::Set => "set",
            Keyword::Echo => "echo",
            Keyword::Return => "return",
        }
    }
}

bitflags! {
    /// Behavioral flags on a code.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CodeFlags: u16 {
        /// Completion is not awaited by the submitter.
        const ASYNCHRONOUS = 1 << 0;
        /// Handled entirely on the SBC, never sent to the firmware.
        const INTERNALLY_PROCESSED = 1 << 1;
        /// Bypasses the firmware-side code buffer (emergency codes).
        const UNBUFFERED = 1 << 2;
        /// Read from a macro file rather than submitted externally.
        const FROM_MACRO = 1 << 3;
        /// Last code of its file.
        const LAST_CODE = 1 << 4;
    }
}

/// One code parameter: a letter plus its raw value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub letter: char,
    pub value: String,
    /// Value was a `{…}` expression to be evaluated firmware-side.
    pub is_expression: bool,
    /// Value was a quoted string literal.
    pub is_string: bool,
}

impl Parameter {
    pub fn new(letter: char, value: impl Into<String>) -> Self {
        Self {
            letter,
            value: value.into(),
            is_expression: false,
            is_string: false,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        self.value.parse().ok()
    }

    pub fn as_float(&self) -> Option<f64> {
        self.value.parse().ok()
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_string {
            write!(f, "{}\"{}\"", self.letter, self.value.replace('"', "\"\""))
        } else if self.is_expression {
            write!(f, "{}{{{}}}", self.letter, self.value)
        } else {
            write!(f, "{}{}", self.letter, self.value)
        }
    }
}

/// One parsed line of G-code.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Code {
    pub channel: Channel,
    #[serde(rename = "type")]
    pub code_type: CodeType,
    pub major: Option<i32>,
    pub minor: Option<i8>,
    pub parameters: Vec<Parameter>,
    pub keyword: Option<Keyword>,
    pub keyword_argument: Option<String>,
    pub comment: Option<String>,
    /// Leading whitespace count; drives block nesting in files.
    pub indent: u8,
    /// Byte offset of this line in its source file.
    pub file_position: Option<u64>,
    pub line_number: Option<u64>,
    /// Length of the line in bytes, including the newline.
    pub length: Option<u64>,
    #[serde(skip)]
    pub flags: CodeFlags,
}

impl Code {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            ..Default::default()
        }
    }

    /// Look up a parameter by letter (case-insensitive).
    pub fn parameter(&self, letter: char) -> Option<&Parameter> {
        self.parameters
            .iter()
            .find(|p| p.letter.eq_ignore_ascii_case(&letter))
    }

    pub fn is_keyword(&self, keyword: Keyword) -> bool {
        self.code_type == CodeType::Keyword && self.keyword == Some(keyword)
    }

    /// True for lines that carry no executable content.
    pub fn is_empty_or_comment(&self) -> bool {
        match self.code_type {
            CodeType::Comment => true,
            CodeType::None => self.parameters.is_empty(),
            _ => false,
        }
    }

    /// Emergency and reset codes skip the per-channel buffer entirely.
    pub fn is_priority(&self) -> bool {
        self.code_type == CodeType::M && matches!(self.major, Some(112) | Some(999))
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code_type {
            // Axis words without a repeated major number (CNC/Laser style).
            CodeType::None => {
                let mut first = true;
                for parameter in &self.parameters {
                    if !first {
                        f.write_str(" ")?;
                    }
                    write!(f, "{parameter}")?;
                    first = false;
                }
                Ok(())
            }
            CodeType::Comment => match &self.comment {
                Some(text) => write!(f, ";{text}"),
                None => Ok(()),
            },
            CodeType::Keyword => {
                let keyword = self.keyword.map(Keyword::as_str).unwrap_or_default();
                match &self.keyword_argument {
                    Some(arg) => write!(f, "{keyword} {arg}"),
                    None => f.write_str(keyword),
                }
            }
            CodeType::G | CodeType::M | CodeType::T => {
                let letter = match self.code_type {
                    CodeType::G => 'G',
                    CodeType::M => 'M',
                    _ => 'T',
                };
                match (self.major, self.minor) {
                    (Some(major), Some(minor)) => write!(f, "{letter}{major}.{minor}")?,
                    (Some(major), None) => write!(f, "{letter}{major}")?,
                    _ => write!(f, "{letter}")?,
                }
                for parameter in &self.parameters {
                    write!(f, " {parameter}")?;
                }
                if let Some(comment) = &self.comment {
                    write!(f, " ;{comment}")?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_bits_are_distinct() {
        let mut mask = 0u16;
        for channel in Channel::ALL {
            assert_eq!(mask & channel.bit(), 0);
            mask |= channel.bit();
        }
        assert_eq!(mask.count_ones() as usize, Channel::COUNT);
    }

    #[test]
    fn display_round_trip() {
        let mut code = Code::new(Channel::Http);
        code.code_type = CodeType::G;
        code.major = Some(1);
        code.parameters.push(Parameter::new('X', "10.5"));
        code.parameters.push(Parameter::new('F', "3000"));
        assert_eq!(code.to_string(), "G1 X10.5 F3000");
    }

    #[test]
    fn priority_codes() {
        let mut code = Code::new(Channel::Usb);
        code.code_type = CodeType::M;
        code.major = Some(112);
        assert!(code.is_priority());
        code.major = Some(115);
        assert!(!code.is_priority());
    }
}
