use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::protocol::command::Command;
use crate::protocol::error::ProtocolError;

/// Reads commands off a connection: a whitespace-separated line terminated
/// by `\r\n`, then, for SET and MSET, the declared number of payload bytes
/// and a trailing `\r\n`.
pub struct Parser<R> {
    reader: R,
}

impl<R: AsyncBufRead + Unpin> Parser<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    pub async fn next_command(&mut self) -> Result<Command, ProtocolError> {
        let mut line = Vec::new();
        let n = self.reader.read_until(b'\n', &mut line).await?;
        if n == 0 {
            return Err(ProtocolError::ConnectionClosed);
        }
        if line.last() != Some(&b'\n') {
            // Partial line at EOF
            return Err(ProtocolError::ConnectionClosed);
        }
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }

        let line = std::str::from_utf8(&line).map_err(|_| ProtocolError::InvalidEncoding)?;
        let mut fields = line.split_ascii_whitespace();
        let name = fields
            .next()
            .ok_or(ProtocolError::EmptyCommand)?
            .to_ascii_uppercase();
        let args: Vec<String> = fields.map(|s| s.to_string()).collect();

        let mut command = Command {
            name,
            args,
            payload: Vec::new(),
        };

        if command.requires_payload() {
            command.payload = self.read_payload(&command).await?;
        }

        Ok(command)
    }

    async fn read_payload(&mut self, command: &Command) -> Result<Vec<u8>, ProtocolError> {
        let total = match command.name.as_str() {
            "SET" => {
                // SET <key> <len> [opt ...]
                if command.args.len() < 2 {
                    return Err(ProtocolError::InvalidArgs);
                }
                parse_len(&command.args[1])?
            }
            "MSET" => {
                // MSET <k1> <len1> <k2> <len2> ...; payloads are concatenated
                if command.args.len() % 2 != 0 {
                    return Err(ProtocolError::InvalidArgs);
                }
                let mut total = 0usize;
                for length in command.args.iter().skip(1).step_by(2) {
                    total += parse_len(length)?;
                }
                total
            }
            _ => return Ok(Vec::new()),
        };

        let mut payload = vec![0u8; total];
        self.reader.read_exact(&mut payload).await?;

        let mut crlf = [0u8; 2];
        self.reader.read_exact(&mut crlf).await?;
        if crlf != *b"\r\n" {
            return Err(ProtocolError::InvalidPayload);
        }

        Ok(payload)
    }
}

fn parse_len(raw: &str) -> Result<usize, ProtocolError> {
    raw.parse::<usize>().map_err(|_| ProtocolError::InvalidArgs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    async fn parse_one(input: &[u8]) -> Result<Command, ProtocolError> {
        Parser::new(Cursor::new(input.to_vec())).next_command().await
    }

    #[tokio::test]
    async fn parses_simple_command() {
        let cmd = parse_one(b"GET mykey\r\n").await.unwrap();
        assert_eq!(cmd.name, "GET");
        assert_eq!(cmd.args, vec!["mykey"]);
        assert!(cmd.payload.is_empty());
    }

    #[tokio::test]
    async fn command_names_are_case_insensitive() {
        let cmd = parse_one(b"get mykey\r\n").await.unwrap();
        assert_eq!(cmd.name, "GET");
    }

    #[tokio::test]
    async fn parses_set_with_payload() {
        let cmd = parse_one(b"SET k 5\r\nhello\r\n").await.unwrap();
        assert_eq!(cmd.name, "SET");
        assert_eq!(cmd.args, vec!["k", "5"]);
        assert_eq!(cmd.payload, b"hello");
    }

    #[tokio::test]
    async fn parses_set_options_after_length() {
        let cmd = parse_one(b"SET k 2 EX 1000 NX\r\nhi\r\n").await.unwrap();
        assert_eq!(cmd.args, vec!["k", "2", "EX", "1000", "NX"]);
        assert_eq!(cmd.payload, b"hi");
    }

    #[tokio::test]
    async fn binary_payload_passes_through() {
        let cmd = parse_one(b"SET k 4\r\n\x00\x01\xFF\n\r\n").await.unwrap();
        assert_eq!(cmd.payload, b"\x00\x01\xFF\n");
    }

    #[tokio::test]
    async fn parses_mset_with_concatenated_payloads() {
        let cmd = parse_one(b"MSET a 3 b 2\r\nonehi\r\n").await.unwrap();
        assert_eq!(cmd.args, vec!["a", "3", "b", "2"]);
        assert_eq!(cmd.payload, b"onehi");
    }

    #[tokio::test]
    async fn rejects_missing_payload_terminator() {
        let err = parse_one(b"SET k 5\r\nhelloXX").await.unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload));
    }

    #[tokio::test]
    async fn rejects_bad_length() {
        let err = parse_one(b"SET k abc\r\n").await.unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidArgs));
    }

    #[tokio::test]
    async fn rejects_odd_mset_arity() {
        let err = parse_one(b"MSET a 3 b\r\none\r\n").await.unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidArgs));
    }

    #[tokio::test]
    async fn empty_line_is_an_error() {
        let err = parse_one(b"\r\n").await.unwrap_err();
        assert!(matches!(err, ProtocolError::EmptyCommand));
    }

    #[tokio::test]
    async fn eof_reports_connection_closed() {
        let err = parse_one(b"").await.unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionClosed));
    }

    #[tokio::test]
    async fn parses_back_to_back_commands() {
        let mut parser = Parser::new(Cursor::new(b"PING\r\nSET k 2\r\nok\r\n".to_vec()));
        assert_eq!(parser.next_command().await.unwrap().name, "PING");
        let set = parser.next_command().await.unwrap();
        assert_eq!(set.name, "SET");
        assert_eq!(set.payload, b"ok");
        assert!(matches!(
            parser.next_command().await,
            Err(ProtocolError::ConnectionClosed)
        ));
    }
}
