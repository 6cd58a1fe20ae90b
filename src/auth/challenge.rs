//! `WWW-Authenticate` / `Proxy-Authenticate` parsing.
//!
//! A header may carry several challenges, and a response may repeat the
//! header. Each challenge is a scheme token followed by either a `token68`
//! or a comma separated list of `name=value` parameters, where values may be
//! quoted strings.

use http::HeaderValue;

/// One challenge offered by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    scheme: String,
    token: Option<String>,
    params: Vec<(String, String)>,
}

impl Challenge {
    #[cfg(test)]
    pub(crate) fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Scheme tokens are case-insensitive.
    pub fn is(&self, scheme: &str) -> bool {
        self.scheme.eq_ignore_ascii_case(scheme)
    }

    /// The `token68` following the scheme, e.g. the base64 NTLM Type 2.
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// A parameter value, looked up case-insensitively.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Parses every challenge found in `values`, skipping what cannot be read.
pub(crate) fn parse<'a, I>(values: I) -> Vec<Challenge>
where
    I: IntoIterator<Item = &'a HeaderValue>,
{
    let mut out = Vec::new();
    for value in values {
        match value.to_str() {
            Ok(s) => parse_str(s, &mut out),
            Err(_) => log::warn!("ignoring non-visible-ascii authentication challenge"),
        }
    }
    out
}

fn parse_str(s: &str, out: &mut Vec<Challenge>) {
    let mut p = Cursor {
        s: s.as_bytes(),
        pos: 0,
    };

    loop {
        p.skip_separators();
        if p.eof() {
            break;
        }

        let scheme = p.token();
        if scheme.is_empty() {
            p.skip_past_comma();
            continue;
        }
        let mut challenge = Challenge {
            scheme,
            token: None,
            params: Vec::new(),
        };
        p.skip_spaces();

        let save = p.pos;
        let token68 = p.token68();
        p.skip_spaces();
        if !token68.is_empty() && matches!(p.peek(), None | Some(b',')) {
            challenge.token = Some(token68);
            out.push(challenge);
            continue;
        }
        p.pos = save;

        loop {
            p.skip_spaces();
            let save = p.pos;
            let name = p.token();
            p.skip_spaces();
            if name.is_empty() || p.peek() != Some(b'=') {
                // the start of the next challenge
                p.pos = save;
                break;
            }
            p.bump();
            p.skip_spaces();
            let value = if p.peek() == Some(b'"') {
                p.quoted()
            } else {
                p.token()
            };
            challenge.params.push((name, value));

            p.skip_spaces();
            if p.peek() == Some(b',') {
                p.skip_separators();
                continue;
            }
            break;
        }
        out.push(challenge);
    }
}

struct Cursor<'a> {
    s: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn eof(&self) -> bool {
        self.pos >= self.s.len()
    }

    fn peek(&self) -> Option<u8> {
        self.s.get(self.pos).copied()
    }

    fn bump(&mut self) {
        self.pos += 1;
    }

    fn skip_spaces(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t')) {
            self.bump();
        }
    }

    fn skip_separators(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b',')) {
            self.bump();
        }
    }

    fn skip_past_comma(&mut self) {
        while let Some(b) = self.peek() {
            self.bump();
            if b == b',' {
                break;
            }
        }
    }

    fn take_while(&mut self, f: impl Fn(u8) -> bool) -> String {
        let start = self.pos;
        while self.peek().map_or(false, &f) {
            self.bump();
        }
        String::from_utf8_lossy(&self.s[start..self.pos]).into_owned()
    }

    fn token(&mut self) -> String {
        self.take_while(is_tchar)
    }

    fn token68(&mut self) -> String {
        let start = self.pos;
        while self
            .peek()
            .map_or(false, |b| b.is_ascii_alphanumeric() || b"-._~+/".contains(&b))
        {
            self.bump();
        }
        if self.pos == start {
            return String::new();
        }
        while self.peek() == Some(b'=') {
            self.bump();
        }
        String::from_utf8_lossy(&self.s[start..self.pos]).into_owned()
    }

    fn quoted(&mut self) -> String {
        let mut out = Vec::new();
        self.bump();
        while let Some(b) = self.peek() {
            self.bump();
            match b {
                b'"' => break,
                b'\\' => {
                    if let Some(escaped) = self.peek() {
                        out.push(escaped);
                        self.bump();
                    }
                }
                b => out.push(b),
            }
        }
        String::from_utf8_lossy(&out).into_owned()
    }
}

fn is_tchar(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}
