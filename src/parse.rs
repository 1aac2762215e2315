//! Tokenizing assembly source files.
//!
//! This module turns source text into the flat [`Token`] stream consumed by
//! the resolver in [`crate::asm`]. The source format is line-oriented:
//!
//! - `;` starts a comment that runs to the end of the line.
//! - A line starting with `#` is a literal line; the rest of the line is
//!   emitted as raw bytes after `%HH` escape substitution.
//! - A line starting with `.` is a directive (`include`, `literal`,
//!   `bits8`/`bits16`/`bits32`/`bits64`, `space`).
//! - Any other non-blank line is an optional `label:` followed by an
//!   optional instruction with comma-separated arguments.
//!
//! Directives are resolved here: by the time tokenization finishes, the
//! stream contains only labels, instructions, arguments and literal bytes.
//! `include` recursively tokenizes the named file in place; every file may
//! be opened at most once per tokenization, so include cycles abort with
//! [`ParseErrKind::IncludeCycle`].

use std::borrow::Cow;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::err::SourceLoc;

/// The payload of a [`Token`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    /// A label declaration (without the trailing colon).
    Label(String),
    /// An instruction mnemonic.
    Instruction(String),
    /// One argument of the preceding instruction.
    Arg(String),
    /// Raw bytes from a literal line or a data directive.
    Literal(Vec<u8>),
}

/// A unit of assembly source, tagged with its source position.
///
/// Tokens are immutable once emitted by the tokenizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// What the token is.
    pub kind: TokenKind,
    /// Where the token came from.
    pub loc: SourceLoc,
}

/// Kinds of errors that can occur while tokenizing source.
///
/// See [`ParseErr`] for this error type with position information included.
#[derive(Debug)]
pub enum ParseErrKind {
    /// A `.` line with nothing after it.
    ExpectedDirective,
    /// A directive that is not in the directive table.
    UnknownDirective(String),
    /// A `#` or `.literal` line with no content.
    ExpectedLiteral,
    /// An `.include` with no file name.
    ExpectedIncludeFile,
    /// A bits directive with no operands. The payload is the bit width.
    ExpectedBits(u32),
    /// A bits directive operand that does not parse at the required width.
    BadNumber {
        /// The operand text.
        text: String,
        /// The required width in bits.
        bits: u32,
    },
    /// A `.space` with no size.
    ExpectedSpaceSize,
    /// A `.space` size that does not parse.
    BadSpaceSize(String),
    /// A label that does not match `[A-Za-z_][A-Za-z0-9_]*`.
    BadLabel(String),
    /// A file was included a second time.
    IncludeCycle(PathBuf),
    /// A file could not be opened or read.
    Io {
        /// The file that failed.
        path: PathBuf,
        /// The underlying failure.
        error: io::Error,
    },
}

impl ParseErrKind {
    pub(crate) fn help(&self) -> Option<Cow<str>> {
        match self {
            Self::ExpectedDirective |
            Self::UnknownDirective(_) => {
                Some("known directives are include, literal, bits8, bits16, bits32, bits64 and space".into())
            }
            Self::BadNumber { bits, .. } => {
                Some(format!("operands must be unsigned numbers that fit in {bits} bits; 0x, 0o and 0b prefixes are accepted").into())
            }
            Self::BadLabel(_) => {
                Some("labels start with a letter or underscore and contain only letters, digits and underscores".into())
            }
            Self::IncludeCycle(_) => {
                Some("every file may be included at most once; check for circular includes".into())
            }
            _ => None,
        }
    }
}

impl fmt::Display for ParseErrKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExpectedDirective    => f.write_str("expected a directive name"),
            Self::UnknownDirective(d)  => write!(f, "unknown directive '{d}'"),
            Self::ExpectedLiteral      => f.write_str("expected literal content"),
            Self::ExpectedIncludeFile  => f.write_str("expected file name to include"),
            Self::ExpectedBits(_)      => f.write_str("expected literal bytes after bits directive"),
            Self::BadNumber { text, bits } => write!(f, "cannot convert '{text}' to a {bits} bit number"),
            Self::ExpectedSpaceSize    => f.write_str("expected a number of bytes after space directive"),
            Self::BadSpaceSize(t)      => write!(f, "cannot parse space size '{t}'"),
            Self::BadLabel(l)          => write!(f, "'{l}' is not a valid label name"),
            Self::IncludeCycle(p)      => write!(f, "file '{}' is included more than once", p.display()),
            Self::Io { path, error }   => write!(f, "cannot read '{}': {error}", path.display()),
        }
    }
}

/// Error from tokenizing source.
#[derive(Debug)]
pub struct ParseErr {
    /// The kind of failure.
    pub kind: ParseErrKind,
    /// The position the failure is tied to. For a failing `include`, this
    /// is the include site.
    pub loc: SourceLoc,
}

impl ParseErr {
    /// Creates a new [`ParseErr`].
    pub fn new(kind: ParseErrKind, loc: SourceLoc) -> Self {
        ParseErr { kind, loc }
    }
}

impl fmt::Display for ParseErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.loc, self.kind)
    }
}

impl std::error::Error for ParseErr {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ParseErrKind::Io { error, .. } => Some(error),
            _ => None,
        }
    }
}

impl crate::err::Error for ParseErr {
    fn loc(&self) -> Option<&SourceLoc> {
        Some(&self.loc)
    }

    fn help(&self) -> Option<Cow<str>> {
        self.kind.help()
    }
}

/// Tokenizes the assembly file at `path`, recursively expanding `.include`
/// directives.
///
/// # Example
/// ```no_run
/// use menagerie::parse::tokenize;
///
/// let tokens = tokenize("prog.asm").unwrap();
/// ```
pub fn tokenize(path: impl AsRef<Path>) -> Result<Vec<Token>, ParseErr> {
    let mut t = Tokenizer::default();
    t.include_file(path.as_ref(), None)?;
    Ok(t.tokens)
}

/// Tokenizes assembly source held in memory.
///
/// `name` is the file name reported in source positions. `.include`
/// directives resolve against the current directory.
///
/// # Example
/// ```
/// use menagerie::parse::{tokenize_source, TokenKind};
///
/// let tokens = tokenize_source("demo.asm", "loop: addi t0, zero, 1").unwrap();
/// assert_eq!(tokens[0].kind, TokenKind::Label("loop".to_string()));
/// assert_eq!(tokens[1].kind, TokenKind::Instruction("addi".to_string()));
/// assert_eq!(tokens[2].kind, TokenKind::Arg("t0".to_string()));
/// ```
pub fn tokenize_source(name: &str, src: &str) -> Result<Vec<Token>, ParseErr> {
    let mut t = Tokenizer::default();
    t.consume_source(Arc::from(name), src, Path::new("."))?;
    Ok(t.tokens)
}

#[derive(Default)]
struct Tokenizer {
    tokens: Vec<Token>,
    /// Canonical paths of every file opened so far.
    opened: HashSet<PathBuf>,
}

impl Tokenizer {
    /// Reads and tokenizes one file. `site` is the `.include` position, or
    /// `None` for the top-level file.
    fn include_file(&mut self, path: &Path, site: Option<&SourceLoc>) -> Result<(), ParseErr> {
        let err_loc = || match site {
            Some(loc) => loc.clone(),
            None => SourceLoc::new(path.to_string_lossy().into_owned(), 0),
        };

        let canonical = fs::canonicalize(path)
            .map_err(|error| ParseErr::new(ParseErrKind::Io { path: path.into(), error }, err_loc()))?;
        if !self.opened.insert(canonical) {
            return Err(ParseErr::new(ParseErrKind::IncludeCycle(path.into()), err_loc()));
        }

        let src = fs::read_to_string(path)
            .map_err(|error| ParseErr::new(ParseErrKind::Io { path: path.into(), error }, err_loc()))?;

        let file: Arc<str> = Arc::from(path.to_string_lossy().as_ref());
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        self.consume_source(file, &src, dir)
    }

    /// Tokenizes a whole source text. `dir` is the directory `.include`
    /// paths resolve against.
    fn consume_source(&mut self, file: Arc<str>, src: &str, dir: &Path) -> Result<(), ParseErr> {
        for (i, line) in src.lines().enumerate() {
            let loc = SourceLoc { file: file.clone(), line: (i + 1) as u32 };
            self.consume_line(line, loc, dir)?;
        }
        Ok(())
    }

    fn consume_line(&mut self, line: &str, loc: SourceLoc, dir: &Path) -> Result<(), ParseErr> {
        // Strip the comment and surrounding whitespace first. This also
        // means `;` starts a comment inside literal lines.
        let line = line.split(';').next().unwrap_or("").trim();
        if line.is_empty() {
            return Ok(());
        }

        if let Some(rest) = line.strip_prefix('#') {
            if rest.is_empty() {
                return Err(ParseErr::new(ParseErrKind::ExpectedLiteral, loc));
            }
            self.push_literal(rest, loc);
            return Ok(());
        }

        if let Some(rest) = line.strip_prefix('.') {
            return self.consume_directive(rest.trim_start(), loc, dir);
        }

        self.consume_statement(line, loc)
    }

    fn consume_directive(&mut self, text: &str, loc: SourceLoc, dir: &Path) -> Result<(), ParseErr> {
        if text.is_empty() {
            return Err(ParseErr::new(ParseErrKind::ExpectedDirective, loc));
        }

        let (name, args) = split_once_ws(text);
        match name {
            "include" => {
                let file = args.trim();
                if file.is_empty() {
                    return Err(ParseErr::new(ParseErrKind::ExpectedIncludeFile, loc));
                }
                self.include_file(&dir.join(file), Some(&loc))
            }
            "literal" => {
                let lit = args.trim();
                if lit.is_empty() {
                    return Err(ParseErr::new(ParseErrKind::ExpectedLiteral, loc));
                }
                self.push_literal(lit, loc);
                Ok(())
            }
            "bits8"  => self.consume_bits(args, 1, loc),
            "bits16" => self.consume_bits(args, 2, loc),
            "bits32" => self.consume_bits(args, 4, loc),
            "bits64" => self.consume_bits(args, 8, loc),
            "space"  => self.consume_space(args.trim(), loc),
            _ => Err(ParseErr::new(ParseErrKind::UnknownDirective(name.to_string()), loc)),
        }
    }

    /// Emits the operands of a bits directive as little-endian integers of
    /// `size` bytes each.
    fn consume_bits(&mut self, args: &str, size: usize, loc: SourceLoc) -> Result<(), ParseErr> {
        let bits = size as u32 * 8;
        let args = args.trim();
        if args.is_empty() {
            return Err(ParseErr::new(ParseErrKind::ExpectedBits(bits), loc));
        }

        let mut literal = Vec::new();
        for arg in args.split_ascii_whitespace() {
            let n = parse_unsigned(arg, bits).ok_or_else(|| {
                ParseErr::new(ParseErrKind::BadNumber { text: arg.to_string(), bits }, loc.clone())
            })?;
            literal.extend_from_slice(&n.to_le_bytes()[..size]);
        }

        self.tokens.push(Token { kind: TokenKind::Literal(literal), loc });
        Ok(())
    }

    fn consume_space(&mut self, args: &str, loc: SourceLoc) -> Result<(), ParseErr> {
        if args.is_empty() {
            return Err(ParseErr::new(ParseErrKind::ExpectedSpaceSize, loc));
        }
        let n = parse_unsigned(args, 64)
            .ok_or_else(|| ParseErr::new(ParseErrKind::BadSpaceSize(args.to_string()), loc.clone()))?;

        self.tokens.push(Token { kind: TokenKind::Literal(vec![0; n as usize]), loc });
        Ok(())
    }

    /// Parses an `(label ':')? (mnemonic args?)?` line.
    fn consume_statement(&mut self, line: &str, loc: SourceLoc) -> Result<(), ParseErr> {
        let rest = match line.split_once(':') {
            Some((label, rest)) => {
                let label = label.trim_end();
                if !is_label(label) {
                    return Err(ParseErr::new(ParseErrKind::BadLabel(label.to_string()), loc));
                }
                self.tokens.push(Token {
                    kind: TokenKind::Label(label.to_string()),
                    loc: loc.clone(),
                });
                rest.trim_start()
            }
            None => line,
        };
        if rest.is_empty() {
            return Ok(());
        }

        let (mnemonic, args) = split_once_ws(rest);
        self.tokens.push(Token {
            kind: TokenKind::Instruction(mnemonic.to_string()),
            loc: loc.clone(),
        });

        if !args.trim().is_empty() {
            for arg in args.split(',') {
                self.tokens.push(Token {
                    kind: TokenKind::Arg(arg.trim().to_string()),
                    loc: loc.clone(),
                });
            }
        }
        Ok(())
    }

    /// Decodes the `%HH` escapes of a literal line and emits the bytes.
    ///
    /// `%%` is a literal `%`. A `%` that is not followed by two hex digits
    /// is copied through unchanged.
    fn push_literal(&mut self, text: &str, loc: SourceLoc) {
        let bytes = text.as_bytes();
        let mut out = Vec::with_capacity(bytes.len());

        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] != b'%' {
                out.push(bytes[i]);
                i += 1;
            } else if i + 1 < bytes.len() && bytes[i + 1] == b'%' {
                out.push(b'%');
                i += 2;
            } else if i + 2 < bytes.len() {
                match (hex_digit(bytes[i + 1]), hex_digit(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push((hi << 4) | lo);
                        i += 3;
                    }
                    _ => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            } else {
                out.push(b'%');
                i += 1;
            }
        }

        self.tokens.push(Token { kind: TokenKind::Literal(out), loc });
    }
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'A'..=b'F' => Some(b - b'A' + 10),
        b'a'..=b'f' => Some(b - b'a' + 10),
        _ => None,
    }
}

fn is_label(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Splits at the first whitespace character, dropping it.
fn split_once_ws(s: &str) -> (&str, &str) {
    match s.find(|c: char| c.is_ascii_whitespace()) {
        Some(i) => (&s[..i], &s[i + 1..]),
        None => (s, ""),
    }
}

/// Parses an unsigned integer with C-style radix prefixes (`0x`, `0o`,
/// `0b`, leading `0` for octal), checking that the value fits in `bits`
/// bits.
pub(crate) fn parse_unsigned(text: &str, bits: u32) -> Option<u64> {
    let (digits, radix) = match text.as_bytes() {
        [b'0', b'x' | b'X', rest @ ..] if !rest.is_empty() => (&text[2..], 16),
        [b'0', b'o' | b'O', rest @ ..] if !rest.is_empty() => (&text[2..], 8),
        [b'0', b'b' | b'B', rest @ ..] if !rest.is_empty() => (&text[2..], 2),
        [b'0', rest @ ..] if !rest.is_empty() => (&text[1..], 8),
        _ => (text, 10),
    };

    let value = u64::from_str_radix(digits, radix).ok()?;
    match bits < 64 && value >> bits != 0 {
        true => None,
        false => Some(value),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use super::{parse_unsigned, tokenize, tokenize_source, ParseErrKind, Token, TokenKind};

    fn kinds(tokens: Vec<Token>) -> Vec<TokenKind> {
        tokens.into_iter().map(|t| t.kind).collect()
    }

    fn label(s: &str) -> TokenKind {
        TokenKind::Label(s.to_string())
    }
    fn instr(s: &str) -> TokenKind {
        TokenKind::Instruction(s.to_string())
    }
    fn arg(s: &str) -> TokenKind {
        TokenKind::Arg(s.to_string())
    }
    fn literal(bytes: &[u8]) -> TokenKind {
        TokenKind::Literal(bytes.to_vec())
    }

    #[test]
    fn test_program() {
        let src = "
;; Basic program exercising every token kind.
_start:
\taddi t1, zero, 1
\tbeq t1, zero, prob\t;; trailing comment
\tebreak
prob:\taddi a0, zero, msg
\tecall

msg:
#Your %6dachine is broken%0A
";
        let tokens = tokenize_source("test.asm", src).unwrap();
        assert_eq!(kinds(tokens), vec![
            label("_start"),
            instr("addi"), arg("t1"), arg("zero"), arg("1"),
            instr("beq"), arg("t1"), arg("zero"), arg("prob"),
            instr("ebreak"),
            label("prob"),
            instr("addi"), arg("a0"), arg("zero"), arg("msg"),
            instr("ecall"),
            label("msg"),
            literal(b"Your machine is broken\n"),
        ]);
    }

    #[test]
    fn test_line_numbers() {
        let tokens = tokenize_source("t.asm", "\n\nfoo: add r0, r1\n").unwrap();
        assert!(tokens.iter().all(|t| t.loc.line == 3));
        assert!(tokens.iter().all(|t| &*t.loc.file == "t.asm"));
    }

    #[test]
    fn test_literal_escapes() {
        let tokens = tokenize_source("t.asm", "#AB%41CD").unwrap();
        assert_eq!(kinds(tokens), vec![literal(b"ABACD")]);

        // %% is a literal percent sign.
        let tokens = tokenize_source("t.asm", "#100%%").unwrap();
        assert_eq!(kinds(tokens), vec![literal(b"100%")]);

        // Short or malformed escapes are copied through.
        let tokens = tokenize_source("t.asm", "#x%4").unwrap();
        assert_eq!(kinds(tokens), vec![literal(b"x%4")]);
        let tokens = tokenize_source("t.asm", "#x%G1y").unwrap();
        assert_eq!(kinds(tokens), vec![literal(b"x%G1y")]);

        // Both hex digit cases decode.
        let tokens = tokenize_source("t.asm", "#%ff%FF%0a!").unwrap();
        assert_eq!(kinds(tokens), vec![literal(&[0xFF, 0xFF, 0x0A, b'!'])]);
    }

    #[test]
    fn test_empty_literal() {
        let err = tokenize_source("t.asm", "#").unwrap_err();
        assert!(matches!(err.kind, ParseErrKind::ExpectedLiteral));
        assert_eq!(err.to_string(), "t.asm:1: expected literal content");
    }

    #[test]
    fn test_bits_directives() {
        let tokens = tokenize_source("t.asm", ".bits8 1 2 0xff").unwrap();
        assert_eq!(kinds(tokens), vec![literal(&[1, 2, 0xFF])]);

        let tokens = tokenize_source("t.asm", ".bits16 0x1234 5").unwrap();
        assert_eq!(kinds(tokens), vec![literal(&[0x34, 0x12, 5, 0])]);

        let tokens = tokenize_source("t.asm", ".bits32 0xdeadbeef").unwrap();
        assert_eq!(kinds(tokens), vec![literal(&[0xEF, 0xBE, 0xAD, 0xDE])]);

        let tokens = tokenize_source("t.asm", ".bits64 1").unwrap();
        assert_eq!(kinds(tokens), vec![literal(&[1, 0, 0, 0, 0, 0, 0, 0])]);
    }

    #[test]
    fn test_bits_range() {
        // 256 does not fit in 8 bits.
        let err = tokenize_source("t.asm", ".bits8 256").unwrap_err();
        assert!(matches!(err.kind, ParseErrKind::BadNumber { bits: 8, .. }));

        // 255 does.
        let tokens = tokenize_source("t.asm", ".bits8 255").unwrap();
        assert_eq!(kinds(tokens), vec![literal(&[255])]);

        let err = tokenize_source("t.asm", ".bits16 0x10000").unwrap_err();
        assert!(matches!(err.kind, ParseErrKind::BadNumber { bits: 16, .. }));

        let err = tokenize_source("t.asm", ".bits8").unwrap_err();
        assert!(matches!(err.kind, ParseErrKind::ExpectedBits(8)));
    }

    #[test]
    fn test_space() {
        let tokens = tokenize_source("t.asm", ".space 4").unwrap();
        assert_eq!(kinds(tokens), vec![literal(&[0, 0, 0, 0])]);

        let err = tokenize_source("t.asm", ".space").unwrap_err();
        assert!(matches!(err.kind, ParseErrKind::ExpectedSpaceSize));

        let err = tokenize_source("t.asm", ".space lots").unwrap_err();
        assert!(matches!(err.kind, ParseErrKind::BadSpaceSize(_)));
    }

    #[test]
    fn test_literal_directive() {
        let tokens = tokenize_source("t.asm", ".literal hi there").unwrap();
        assert_eq!(kinds(tokens), vec![literal(b"hi there")]);
    }

    #[test]
    fn test_unknown_directive() {
        let err = tokenize_source("t.asm", ".frobnicate 1 2").unwrap_err();
        assert!(matches!(err.kind, ParseErrKind::UnknownDirective(d) if d == "frobnicate"));

        let err = tokenize_source("t.asm", ".").unwrap_err();
        assert!(matches!(err.kind, ParseErrKind::ExpectedDirective));
    }

    #[test]
    fn test_labels() {
        let tokens = tokenize_source("t.asm", "foo:\nbar: add r0, r1\n_x9:").unwrap();
        assert_eq!(kinds(tokens), vec![
            label("foo"),
            label("bar"), instr("add"), arg("r0"), arg("r1"),
            label("_x9"),
        ]);

        let err = tokenize_source("t.asm", "9lives: add r0, r1").unwrap_err();
        assert!(matches!(err.kind, ParseErrKind::BadLabel(_)));
    }

    #[test]
    fn test_comments_and_blanks() {
        let tokens = tokenize_source("t.asm", "; nothing\n\n   \nnop ; trailing\n").unwrap();
        assert_eq!(kinds(tokens), vec![instr("nop")]);
    }

    #[test]
    fn test_parse_unsigned() {
        assert_eq!(parse_unsigned("0", 8), Some(0));
        assert_eq!(parse_unsigned("255", 8), Some(255));
        assert_eq!(parse_unsigned("256", 8), None);
        assert_eq!(parse_unsigned("0x10", 8), Some(16));
        assert_eq!(parse_unsigned("0b101", 8), Some(5));
        assert_eq!(parse_unsigned("0o17", 8), Some(15));
        assert_eq!(parse_unsigned("017", 8), Some(15));
        assert_eq!(parse_unsigned("-1", 8), None);
        assert_eq!(parse_unsigned("", 8), None);
        assert_eq!(parse_unsigned("0x", 8), None);
    }

    /// Creates a scratch directory for include tests.
    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("menagerie-parse-{name}-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_include() {
        let dir = scratch_dir("include");
        fs::write(dir.join("main.asm"), ".include lib.asm\nmain: jal ra, helper\n").unwrap();
        fs::write(dir.join("lib.asm"), "helper: jalr zero, ra, 0\n").unwrap();

        let tokens = tokenize(dir.join("main.asm")).unwrap();
        assert_eq!(kinds(tokens), vec![
            label("helper"), instr("jalr"), arg("zero"), arg("ra"), arg("0"),
            label("main"), instr("jal"), arg("ra"), arg("helper"),
        ]);

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_include_cycle() {
        let dir = scratch_dir("cycle");
        fs::write(dir.join("a.asm"), "nop\n.include b.asm\n").unwrap();
        fs::write(dir.join("b.asm"), ".include a.asm\n").unwrap();

        let err = tokenize(dir.join("a.asm")).unwrap_err();
        assert!(matches!(err.kind, ParseErrKind::IncludeCycle(_)));
        // The error points at the include site in b.asm.
        assert_eq!(err.loc.line, 1);
        assert!(err.loc.file.ends_with("b.asm"));

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_include_missing_file() {
        let dir = scratch_dir("missing");
        fs::write(dir.join("main.asm"), ".include nowhere.asm\n").unwrap();

        let err = tokenize(dir.join("main.asm")).unwrap_err();
        assert!(matches!(err.kind, ParseErrKind::Io { .. }));
        assert_eq!(err.loc.line, 1);

        fs::remove_dir_all(dir).unwrap();
    }
}
