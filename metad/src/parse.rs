use crate::error::{Error, Result};

/// Whitespace-delimited token cursor over an in-memory text buffer.
///
/// Byte positions are tracked so incremental readers (the replica hills
/// files) can remember the offset of the last complete record.
pub(crate) struct Tokens<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Tokens<'a> {
    pub(crate) const fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    /// Byte offset of the cursor, after the most recently consumed token.
    pub(crate) const fn pos(&self) -> usize {
        self.pos
    }

    fn skip_whitespace(&mut self) {
        let bytes = self.src.as_bytes();
        while self.pos < bytes.len() {
            let b = bytes[self.pos];
            if b.is_ascii_whitespace() {
                self.pos += 1;
            } else if b == b'#' {
                while self.pos < bytes.len() && bytes[self.pos] != b'\n' {
                    self.pos += 1;
                }
            } else {
                break;
            }
        }
    }

    /// Returns the next token without consuming it.
    pub(crate) fn peek(&mut self) -> Option<&'a str> {
        let saved = self.pos;
        let token = self.next();
        self.pos = saved;
        token
    }

    /// Consumes and returns the next token, or `None` at the end of input.
    pub(crate) fn next(&mut self) -> Option<&'a str> {
        self.skip_whitespace();
        if self.pos >= self.src.len() {
            return None;
        }
        let start = self.pos;
        let bytes = self.src.as_bytes();
        while self.pos < bytes.len() && !bytes[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
        Some(&self.src[start..self.pos])
    }

    pub(crate) fn expect_token(&mut self) -> Result<&'a str> {
        self.next()
            .ok_or_else(|| Error::Parse("unexpected end of input".to_owned()))
    }

    pub(crate) fn expect(&mut self, token: &str) -> Result<()> {
        let found = self.expect_token()?;
        if found == token {
            Ok(())
        } else {
            Err(Error::Parse(format!("expected `{token}`, found `{found}`")))
        }
    }

    pub(crate) fn next_f64(&mut self) -> Result<f64> {
        let token = self.expect_token()?;
        token
            .parse()
            .map_err(|_| Error::Parse(format!("expected a number, found `{token}`")))
    }

    pub(crate) fn next_u64(&mut self) -> Result<u64> {
        let token = self.expect_token()?;
        token
            .parse()
            .map_err(|_| Error::Parse(format!("expected an integer, found `{token}`")))
    }

    pub(crate) fn next_usize(&mut self) -> Result<usize> {
        let token = self.expect_token()?;
        token
            .parse()
            .map_err(|_| Error::Parse(format!("expected an index, found `{token}`")))
    }

    pub(crate) fn next_bool(&mut self) -> Result<bool> {
        let token = self.expect_token()?;
        match token {
            "0" | "off" | "false" => Ok(false),
            "1" | "on" | "true" => Ok(true),
            _ => Err(Error::Parse(format!("expected a flag, found `{token}`"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_skip_comments_and_track_positions() {
        let mut tokens = Tokens::new("alpha # trailing words\n 1.5 12\n");
        assert_eq!(tokens.peek(), Some("alpha"));
        assert_eq!(tokens.next(), Some("alpha"));
        assert_eq!(tokens.next_f64().unwrap(), 1.5);
        let after_float = tokens.pos();
        assert_eq!(tokens.next_u64().unwrap(), 12);
        assert!(tokens.pos() > after_float);
        assert_eq!(tokens.next(), None);
    }

    #[test]
    fn expect_reports_the_offending_token() {
        let mut tokens = Tokens::new("foo");
        let err = tokens.expect("bar").unwrap_err();
        assert!(err.to_string().contains("foo"));
    }
}
