//! Script tokenizer.
//!
//! One command per line: an opcode letter, an optional single separator and a
//! decimal operand (`S02`, `G 0005`), or one of the keywords `DRAW` / `END`.
//! Blank lines and `#` comments are skipped.

use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("failed to read script {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("line {line}: unknown opcode in {text:?}")]
    UnknownOpcode { line: usize, text: String },
    #[error("line {line}: `{opcode}` needs a numeric operand")]
    MissingOperand { line: usize, opcode: char },
    #[error("line {line}: `{opcode}` operand {operand:?} must be 1 to {max_digits} digits")]
    BadOperand {
        line: usize,
        opcode: char,
        operand: String,
        max_digits: usize,
    },
    #[error("script contains no commands")]
    Empty,
}

/// Absolute setpoint commands; each is sent with its own wire prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetpointOpcode {
    G,
    V,
    T,
}

impl SetpointOpcode {
    pub fn wire_prefix(self) -> char {
        match self {
            SetpointOpcode::G => 'W',
            SetpointOpcode::V => 'X',
            SetpointOpcode::T => 'T',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Sampling period in tenths of a second.
    SampleInterval(u32),
    Setpoint { opcode: SetpointOpcode, value: u32 },
    Forward(u32),
    Backward(u32),
    /// Seconds to hold after the last sent command.
    Wait(u32),
    Draw,
    End,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::SampleInterval(n) => write!(f, "S{n:02}"),
            Command::Setpoint { opcode, value } => write!(f, "{opcode:?}{value:04}"),
            Command::Forward(n) => write!(f, "F{n:02}"),
            Command::Backward(n) => write!(f, "B{n:02}"),
            Command::Wait(n) => write!(f, "W{n:02}"),
            Command::Draw => f.write_str("DRAW"),
            Command::End => f.write_str("END"),
        }
    }
}

const SEPARATORS: [char; 4] = [' ', '\t', ',', ':'];

fn operand(line: usize, opcode: char, rest: &str, max_digits: usize) -> Result<u32, ScriptError> {
    let rest = rest
        .strip_prefix(|c: char| SEPARATORS.contains(&c))
        .unwrap_or(rest);
    if rest.is_empty() {
        return Err(ScriptError::MissingOperand { line, opcode });
    }
    if rest.len() > max_digits || !rest.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ScriptError::BadOperand {
            line,
            opcode,
            operand: rest.to_string(),
            max_digits,
        });
    }
    rest.parse().map_err(|_| ScriptError::BadOperand {
        line,
        opcode,
        operand: rest.to_string(),
        max_digits,
    })
}

pub fn parse_line(line: usize, text: &str) -> Result<Option<Command>, ScriptError> {
    let text = text.trim();
    if text.is_empty() || text.starts_with('#') {
        return Ok(None);
    }
    match text {
        "DRAW" => return Ok(Some(Command::Draw)),
        "END" => return Ok(Some(Command::End)),
        _ => {}
    }
    let mut chars = text.chars();
    let Some(opcode) = chars.next() else {
        return Ok(None);
    };
    let rest = chars.as_str();
    let command = match opcode {
        'S' => Command::SampleInterval(operand(line, opcode, rest, 2)?),
        'F' => Command::Forward(operand(line, opcode, rest, 2)?),
        'B' => Command::Backward(operand(line, opcode, rest, 2)?),
        'W' => Command::Wait(operand(line, opcode, rest, 2)?),
        'G' | 'V' | 'T' => {
            let kind = match opcode {
                'G' => SetpointOpcode::G,
                'V' => SetpointOpcode::V,
                _ => SetpointOpcode::T,
            };
            Command::Setpoint {
                opcode: kind,
                value: operand(line, opcode, rest, 4)?,
            }
        }
        _ => {
            return Err(ScriptError::UnknownOpcode {
                line,
                text: text.to_string(),
            })
        }
    };
    Ok(Some(command))
}

/// Parse a whole script. Line numbers in errors are 1-based.
pub fn parse_script(source: &str) -> Result<Vec<Command>, ScriptError> {
    let mut program = Vec::new();
    for (i, text) in source.lines().enumerate() {
        if let Some(cmd) = parse_line(i + 1, text)? {
            program.push(cmd);
        }
    }
    if program.is_empty() {
        return Err(ScriptError::Empty);
    }
    Ok(program)
}

pub fn load_script(path: &Path) -> Result<Vec<Command>, ScriptError> {
    let source = std::fs::read_to_string(path).map_err(|source| ScriptError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_script(&source)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_operands_with_and_without_separator() {
        let program = parse_script("S02\nG 0005\nF:3\nB,12\nW\t01\nV0100\nT9\nDRAW\nEND\n").unwrap();
        assert_eq!(
            program,
            vec![
                Command::SampleInterval(2),
                Command::Setpoint { opcode: SetpointOpcode::G, value: 5 },
                Command::Forward(3),
                Command::Backward(12),
                Command::Wait(1),
                Command::Setpoint { opcode: SetpointOpcode::V, value: 100 },
                Command::Setpoint { opcode: SetpointOpcode::T, value: 9 },
                Command::Draw,
                Command::End,
            ]
        );
    }

    #[test]
    fn skips_blank_lines_and_comments() {
        let program = parse_script("# ramp\n\n  S01  \n# hold\nEND").unwrap();
        assert_eq!(program, vec![Command::SampleInterval(1), Command::End]);
    }

    #[test]
    fn unknown_opcode_is_rejected_with_line_number() {
        let err = parse_script("S01\nQ12\nEND").unwrap_err();
        assert!(matches!(err, ScriptError::UnknownOpcode { line: 2, .. }));
    }

    #[test]
    fn operand_length_depends_on_opcode() {
        assert!(matches!(
            parse_line(1, "F123"),
            Err(ScriptError::BadOperand { max_digits: 2, .. })
        ));
        assert!(parse_line(1, "G1234").is_ok());
        assert!(matches!(
            parse_line(1, "G12345"),
            Err(ScriptError::BadOperand { max_digits: 4, .. })
        ));
    }

    #[test]
    fn missing_or_non_numeric_operand_is_rejected() {
        assert!(matches!(
            parse_line(4, "W"),
            Err(ScriptError::MissingOperand { line: 4, opcode: 'W' })
        ));
        assert!(matches!(parse_line(1, "S 1x"), Err(ScriptError::BadOperand { .. })));
        assert!(matches!(parse_line(1, "S  1"), Err(ScriptError::BadOperand { .. })));
    }

    #[test]
    fn keywords_are_whole_line() {
        assert!(matches!(
            parse_line(1, "DRAWX"),
            Err(ScriptError::UnknownOpcode { .. })
        ));
        assert!(matches!(parse_line(1, "ENDS"), Err(ScriptError::UnknownOpcode { .. })));
    }

    #[test]
    fn empty_script_is_an_error() {
        assert!(matches!(parse_script("# nothing\n"), Err(ScriptError::Empty)));
    }

    #[test]
    fn display_uses_canonical_form() {
        let cmd = Command::Setpoint { opcode: SetpointOpcode::V, value: 42 };
        assert_eq!(cmd.to_string(), "V0042");
        assert_eq!(Command::Wait(3).to_string(), "W03");
    }
}
