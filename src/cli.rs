//! Interactive prompt for the backend client.
//!
//! Each line is either a dot-command (only `.exit` today) or an operation
//! element such as `<get-config><source><running/></source></get-config>`,
//! which the client wraps in an `<rpc>` and sends.
use std::io::{self, BufRead, Write};

use thiserror::Error;

/// Possible commands from a user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// `.exit`, or end of input
    Exit,
    /// Operation XML to send
    Rpc(String),
}

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("prompt io error: {0}")]
    Io(#[from] io::Error),

    #[error("unrecognized command '{0}'")]
    Unrecognized(String),
}

/// Prompt user for a command.
pub fn prompt<R, W>(mut reader: R, mut writer: W) -> Result<Command, PromptError>
where
    R: BufRead,
    W: Write,
{
    let mut s = String::default();
    write!(&mut writer, "> ")?;
    writer.flush()?;

    if reader.read_line(&mut s)? == 0 {
        return Ok(Command::Exit);
    }

    match s.trim() {
        ".exit" => Ok(Command::Exit),
        s if !s.starts_with('.') => Ok(Command::Rpc(s.to_string())),
        s => Err(PromptError::Unrecognized(s.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_prints_correctly() {
        let input = b".exit\n";
        let mut output = Vec::new();

        prompt(&input[..], &mut output).unwrap();

        let output = String::from_utf8(output).expect("not valid UTF-8");
        assert_eq!("> ", output);
    }

    #[test]
    fn prompt_handles_operations() {
        let input = b"  <get-config><source><running/></source></get-config>\n";
        let mut output = Vec::new();

        let res = prompt(&input[..], &mut output).unwrap();
        assert_eq!(
            Command::Rpc("<get-config><source><running/></source></get-config>".to_string()),
            res
        );
    }

    #[test]
    fn prompt_exits_on_eof() {
        let mut output = Vec::new();

        let res = prompt(&b""[..], &mut output).unwrap();
        assert_eq!(Command::Exit, res);
    }

    #[test]
    fn prompt_unrecognized_command() {
        let input = b".something_wrong\n";
        let mut output = Vec::new();

        let err = prompt(&input[..], &mut output).unwrap_err();
        assert_eq!(err.to_string(), "unrecognized command '.something_wrong'");
    }
}
