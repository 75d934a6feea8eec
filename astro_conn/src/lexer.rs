//! Parameter cursor over one protocol line.
//!
//! Tokens are separated by ASCII whitespace. A token starting with `"`
//! runs to the next `"` and may contain spaces. Numeric accessors also stop
//! at `,`. One delimiter after each token is consumed with it.
//!
//! The cursor never mutates the line; every accessor returns a view into
//! it and advances the position.

use crate::error::ParamError;
use std::str::FromStr;
use std::time::Duration;

const NUMBER_DELIM: &[u8] = b",";

#[derive(Debug, Clone)]
pub struct ParamCursor<'a> {
    line: &'a str,
    pos: usize,
}

impl<'a> ParamCursor<'a> {
    pub fn new(line: &'a str) -> Self {
        Self { line, pos: 0 }
    }

    /// Split the command word from its parameters.
    pub fn split_command(line: &'a str) -> (&'a str, ParamCursor<'a>) {
        let trimmed = line.trim_start_matches(|c: char| c.is_ascii_whitespace());
        let offset = line.len() - trimmed.len();
        let end = trimmed
            .find(|c: char| c.is_ascii_whitespace())
            .unwrap_or(trimmed.len());
        let command = &trimmed[..end];
        let mut cursor = ParamCursor::new(line);
        cursor.pos = (offset + end + 1).min(line.len());
        (command, cursor)
    }

    /// Unconsumed rest of the line.
    pub fn remaining(&self) -> &'a str {
        &self.line[self.pos..]
    }

    fn skip_whitespace(&mut self) {
        let bytes = self.line.as_bytes();
        while self.pos < bytes.len() && bytes[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    /// True once only whitespace is left.
    pub fn param_end(&mut self) -> bool {
        self.skip_whitespace();
        self.pos >= self.line.len()
    }

    /// Fail unless every token was consumed.
    pub fn expect_end(&mut self) -> Result<(), ParamError> {
        if self.param_end() {
            Ok(())
        } else {
            Err(ParamError::Trailing {
                rest: self.remaining().to_string(),
            })
        }
    }

    fn next_token(&mut self, enddelim: &[u8]) -> Result<&'a str, ParamError> {
        self.skip_whitespace();
        let bytes = self.line.as_bytes();
        if self.pos >= bytes.len() {
            return Err(ParamError::Missing);
        }
        if bytes[self.pos] == b'"' {
            let start = self.pos + 1;
            let end = bytes[start..]
                .iter()
                .position(|&b| b == b'"')
                .map_or(bytes.len(), |p| start + p);
            self.pos = (end + 1).min(bytes.len());
            return Ok(&self.line[start..end]);
        }
        let start = self.pos;
        let mut end = start;
        while end < bytes.len() && !bytes[end].is_ascii_whitespace() && !enddelim.contains(&bytes[end])
        {
            end += 1;
        }
        self.pos = (end + 1).min(bytes.len());
        Ok(&self.line[start..end])
    }

    fn next_parsed<T: FromStr>(
        &mut self,
        enddelim: &[u8],
        expected: &'static str,
    ) -> Result<T, ParamError> {
        let token = self.next_token(enddelim)?;
        token.parse().map_err(|_| ParamError::Invalid {
            expected,
            token: token.to_string(),
        })
    }

    pub fn next_string(&mut self) -> Result<&'a str, ParamError> {
        self.next_token(&[])
    }

    /// String ending at whitespace or any byte of `enddelim`.
    pub fn next_string_delim(&mut self, enddelim: &str) -> Result<&'a str, ParamError> {
        self.next_token(enddelim.as_bytes())
    }

    /// Next string, or `None` when the line is exhausted.
    pub fn next_string_opt(&mut self) -> Option<&'a str> {
        if self.param_end() {
            return None;
        }
        self.next_token(&[]).ok()
    }

    pub fn next_integer(&mut self) -> Result<i32, ParamError> {
        self.next_parsed(NUMBER_DELIM, "integer")
    }

    pub fn next_long(&mut self) -> Result<i64, ParamError> {
        self.next_parsed(NUMBER_DELIM, "long")
    }

    pub fn next_size(&mut self) -> Result<usize, ParamError> {
        self.next_parsed(&[], "size")
    }

    /// Double; `nan` is accepted.
    pub fn next_double(&mut self) -> Result<f64, ParamError> {
        self.next_parsed(NUMBER_DELIM, "double")
    }

    /// Double time; a leading `+` means seconds from `now`.
    pub fn next_double_time(&mut self, now: f64) -> Result<f64, ParamError> {
        let token = self.next_token(NUMBER_DELIM)?;
        let value: f64 = token.parse().map_err(|_| ParamError::Invalid {
            expected: "time",
            token: token.to_string(),
        })?;
        if token.starts_with('+') {
            return Ok(value + now);
        }
        Ok(value)
    }

    pub fn next_float(&mut self) -> Result<f32, ParamError> {
        self.next_parsed(NUMBER_DELIM, "float")
    }

    pub fn next_bool(&mut self) -> Result<bool, ParamError> {
        let token = self.next_token(&[])?;
        match token.to_ascii_lowercase().as_str() {
            "1" | "true" | "on" | "yes" => Ok(true),
            "0" | "false" | "off" | "no" => Ok(false),
            _ => Err(ParamError::Invalid {
                expected: "bool",
                token: token.to_string(),
            }),
        }
    }

    /// `<sec> <usec>` pair as time since the epoch.
    pub fn next_timeval(&mut self) -> Result<Duration, ParamError> {
        let sec = self.next_long()?;
        let usec = self.next_long()?;
        if sec < 0 || !(0..1_000_000).contains(&usec) {
            return Err(ParamError::Invalid {
                expected: "timeval",
                token: format!("{sec} {usec}"),
            });
        }
        Ok(Duration::new(sec as u64, (usec * 1000) as u32))
    }

    /// Everything left, verbatim after leading whitespace.
    pub fn whole_string(&mut self) -> &'a str {
        self.skip_whitespace();
        let rest = self.remaining();
        self.pos = self.line.len();
        rest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_command_word() {
        let (cmd, mut params) = ParamCursor::split_command("  S 12 \"all ok\"");
        assert_eq!(cmd, "S");
        assert_eq!(params.next_long().unwrap(), 12);
        assert_eq!(params.next_string().unwrap(), "all ok");
        assert!(params.param_end());

        let (cmd, mut params) = ParamCursor::split_command("info");
        assert_eq!(cmd, "info");
        assert!(params.param_end());
    }

    #[test]
    fn quoted_token_keeps_spaces() {
        let mut params = ParamCursor::new("\"a b  c\" next");
        assert_eq!(params.next_string().unwrap(), "a b  c");
        assert_eq!(params.next_string().unwrap(), "next");
        assert_eq!(params.next_string(), Err(ParamError::Missing));
    }

    #[test]
    fn unterminated_quote_runs_to_end() {
        let mut params = ParamCursor::new("\"open ended");
        assert_eq!(params.next_string().unwrap(), "open ended");
        assert!(params.param_end());
    }

    #[test]
    fn numbers_stop_at_comma() {
        let mut params = ParamCursor::new("1,2 3.5,nan");
        assert_eq!(params.next_integer().unwrap(), 1);
        assert_eq!(params.next_integer().unwrap(), 2);
        assert_eq!(params.next_double().unwrap(), 3.5);
        assert!(params.next_double().unwrap().is_nan());
        assert!(params.param_end());
    }

    #[test]
    fn custom_delimiters() {
        let mut params = ParamCursor::new("key=value");
        assert_eq!(params.next_string_delim("=").unwrap(), "key");
        assert_eq!(params.next_string().unwrap(), "value");
    }

    #[test]
    fn invalid_number_reports_token() {
        let mut params = ParamCursor::new("12x");
        assert_eq!(
            params.next_integer(),
            Err(ParamError::Invalid {
                expected: "integer",
                token: "12x".to_string()
            })
        );
    }

    #[test]
    fn relative_time_adds_now() {
        let mut params = ParamCursor::new("+10 20");
        assert_eq!(params.next_double_time(1000.0).unwrap(), 1010.0);
        assert_eq!(params.next_double_time(1000.0).unwrap(), 20.0);
    }

    #[test]
    fn timeval_and_whole_string() {
        let mut params = ParamCursor::new("1700000000 250000 camd 4   exposure started  ");
        let tv = params.next_timeval().unwrap();
        assert_eq!(tv, Duration::new(1_700_000_000, 250_000_000));
        assert_eq!(params.next_string().unwrap(), "camd");
        assert_eq!(params.next_integer().unwrap(), 4);
        assert_eq!(params.whole_string(), "exposure started  ");
        assert!(params.param_end());
    }

    #[test]
    fn trailing_parameters_rejected() {
        let mut params = ParamCursor::new("1 2");
        params.next_integer().unwrap();
        assert_eq!(
            params.expect_end(),
            Err(ParamError::Trailing {
                rest: "2".to_string()
            })
        );
    }

    #[test]
    fn bool_spellings() {
        let mut params = ParamCursor::new("on 0 TRUE off maybe");
        assert!(params.next_bool().unwrap());
        assert!(!params.next_bool().unwrap());
        assert!(params.next_bool().unwrap());
        assert!(!params.next_bool().unwrap());
        assert!(params.next_bool().is_err());
    }
}
