//! Resolving token streams into addressed, numeric form.
//!
//! This module is the architecture-independent half of the assembler. It
//! takes the flat [`Token`] stream produced by [`crate::parse`] and runs a
//! two-pass layout over it:
//!
//! 1. **Layout.** Every label is bound to the running address; every
//!    instruction is handed to a backend `process` callback, which must
//!    set its size (and may rewrite its arguments or stash a note in the
//!    [`reserved`] slot); every literal advances the address by its
//!    length.
//! 2. **Translation.** With all labels known, every argument string is
//!    turned into a number: label addresses first, then whatever the
//!    backend's `translate` callback makes of it (register names, numeric
//!    literals). One [`DebugToken`] is emitted per instruction alongside.
//!
//! The result is a [`ResolvedToken`] sequence ready for a backend encoder,
//! plus the debug-symbol stream consumed by debugger hosts.
//!
//! [`reserved`]: Instruction::reserved

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;

use crate::err::SourceLoc;
use crate::parse::{ParseErr, ParseErrKind, Token, TokenKind};

/// An instruction mid-resolution, as seen by a backend's `process`
/// callback.
///
/// The callback **must** set [`size`]; it may rewrite [`args`] (for
/// example, stripping addressing-mode punctuation) and set [`reserved`]
/// to carry a decision forward to the encoder.
///
/// [`size`]: Instruction::size
/// [`args`]: Instruction::args
/// [`reserved`]: Instruction::reserved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// The instruction mnemonic.
    pub mnemonic: String,
    /// The raw argument strings, in order.
    pub args: Vec<String>,
    /// Where the instruction came from.
    pub loc: SourceLoc,
    /// The size of the encoded instruction in bytes. Zero until `process`
    /// sets it.
    pub size: u64,
    /// Architecture-scratch slot, carried through to the resolved token.
    ///
    /// Backends give this their own meaning (the 6502 encoder stores the
    /// addressing mode here); it is never interpreted by the resolver.
    pub reserved: u64,
}

/// The payload of a [`ResolvedToken`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedKind {
    /// An instruction with numerically translated arguments.
    Instruction {
        /// The instruction mnemonic.
        mnemonic: String,
        /// The arguments: label addresses, register numbers and parsed
        /// numeric literals.
        args: Vec<u64>,
    },
    /// Raw bytes emitted verbatim into the image.
    Literal(Vec<u8>),
}

/// A token with its absolute address assigned and its arguments
/// translated to numbers.
///
/// Addresses are strictly non-decreasing across a resolved sequence, and
/// each token starts exactly where the previous one ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedToken {
    /// What the token is.
    pub kind: ResolvedKind,
    /// The absolute byte address the token was laid out at.
    pub address: u64,
    /// Where the token came from.
    pub loc: SourceLoc,
    /// The backend's scratch value from [`Instruction::reserved`]
    /// (zero for literals).
    pub reserved: u64,
}

/// A debug-symbol entry: one per instruction, keyed by address.
///
/// Debugger hosts use these to translate addresses to source positions
/// and to pretty-print disassembly; the argument strings are kept in
/// their source form for that purpose.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugToken {
    /// Where the instruction came from.
    pub loc: SourceLoc,
    /// The absolute address of the instruction.
    pub address: u64,
    /// The label bound to this address, if any.
    pub label: Option<String>,
    /// The instruction mnemonic.
    pub mnemonic: String,
    /// The raw argument strings, in order.
    pub args: Vec<String>,
}

/// Failure to translate a single argument string into a number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranslateErr {
    /// The argument is empty.
    Empty,
    /// The argument names no register of the architecture.
    UnknownRegister(String),
    /// The argument is not a parseable number.
    BadNumber(String),
    /// The argument parses but does not fit the immediate field.
    OutOfRange {
        /// The argument text.
        text: String,
        /// The width of the field in bits.
        bits: u32,
    },
}

impl fmt::Display for TranslateErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty              => f.write_str("empty argument"),
            Self::UnknownRegister(r) => write!(f, "no such register: {r}"),
            Self::BadNumber(t)       => write!(f, "cannot parse '{t}' as a number"),
            Self::OutOfRange { text, bits } => write!(f, "immediate '{text}' does not fit in {bits} bits"),
        }
    }
}

impl std::error::Error for TranslateErr {}
impl crate::err::Error for TranslateErr {}

/// Failure from a backend encoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeErr {
    /// The instruction has the wrong number of arguments.
    WrongArgCount {
        /// The instruction mnemonic.
        mnemonic: String,
        /// How many arguments it takes.
        expected: usize,
    },
    /// The mnemonic names no instruction of the architecture.
    UnknownMnemonic(String),
    /// An immediate value does not fit its field.
    ImmTooLarge {
        /// The instruction mnemonic.
        mnemonic: String,
        /// The offending value.
        value: i64,
        /// The width of the field in bits.
        bits: u32,
    },
    /// A branch or jump target is too far away to encode.
    BranchOutOfRange {
        /// The instruction mnemonic.
        mnemonic: String,
        /// The byte offset that failed to encode.
        offset: i64,
    },
    /// An operand has a form the instruction does not support.
    BadOperand {
        /// The instruction mnemonic.
        mnemonic: String,
        /// The offending operand, in source form.
        operand: String,
    },
}

impl fmt::Display for EncodeErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WrongArgCount { mnemonic, expected: 0 } =>
                write!(f, "wrong number of arguments for instruction '{mnemonic}': expected no arguments"),
            Self::WrongArgCount { mnemonic, expected: 1 } =>
                write!(f, "wrong number of arguments for instruction '{mnemonic}': expected 1 argument"),
            Self::WrongArgCount { mnemonic, expected } =>
                write!(f, "wrong number of arguments for instruction '{mnemonic}': expected {expected} arguments"),
            Self::UnknownMnemonic(m) =>
                write!(f, "unknown instruction: {m}"),
            Self::ImmTooLarge { mnemonic, value, bits } =>
                write!(f, "immediate {value} does not fit in {bits} bits for instruction '{mnemonic}'"),
            Self::BranchOutOfRange { mnemonic, offset } =>
                write!(f, "branch target out of range for instruction '{mnemonic}': offset {offset}"),
            Self::BadOperand { mnemonic, operand } =>
                write!(f, "bad operand '{operand}' for instruction '{mnemonic}'"),
        }
    }
}

impl std::error::Error for EncodeErr {}
impl crate::err::Error for EncodeErr {}

/// Kinds of errors that can occur while assembling source.
///
/// See [`AsmErr`] for this error type with position information included.
#[derive(Debug)]
pub enum AsmErrKind {
    /// The tokenizer failed.
    Parse(ParseErrKind),
    /// The same label was defined twice.
    DuplicateLabel(String),
    /// An argument is neither a label nor translatable by the backend.
    Translate {
        /// The argument text.
        arg: String,
        /// What went wrong with it.
        err: TranslateErr,
    },
    /// The backend encoder rejected an instruction.
    Encode(EncodeErr),
}

impl fmt::Display for AsmErrKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(p) => p.fmt(f),
            Self::DuplicateLabel(l) => write!(f, "label '{l}' is defined more than once"),
            Self::Translate { arg, err } => write!(f, "cannot translate argument '{arg}': {err}"),
            Self::Encode(e) => e.fmt(f),
        }
    }
}

/// Error from assembling source: tokenizing, resolving or encoding.
///
/// Displays as `file:line: message`.
#[derive(Debug)]
pub struct AsmErr {
    /// The kind of failure.
    pub kind: AsmErrKind,
    /// The source position of the failure.
    pub loc: SourceLoc,
}

impl AsmErr {
    /// Creates a new [`AsmErr`].
    pub fn new(kind: AsmErrKind, loc: SourceLoc) -> Self {
        AsmErr { kind, loc }
    }

    /// Creates an [`AsmErr`] from an encoder failure.
    pub fn encode(err: EncodeErr, loc: SourceLoc) -> Self {
        AsmErr { kind: AsmErrKind::Encode(err), loc }
    }
}

impl fmt::Display for AsmErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.loc, self.kind)
    }
}

impl std::error::Error for AsmErr {}

impl crate::err::Error for AsmErr {
    fn loc(&self) -> Option<&SourceLoc> {
        Some(&self.loc)
    }

    fn help(&self) -> Option<Cow<str>> {
        match &self.kind {
            AsmErrKind::Parse(p) => p.help(),
            AsmErrKind::DuplicateLabel(_) => Some("labels must be unique; rename one of the definitions".into()),
            AsmErrKind::Translate { .. } => None,
            AsmErrKind::Encode(_) => None,
        }
    }
}

impl From<ParseErr> for AsmErr {
    fn from(err: ParseErr) -> Self {
        AsmErr { kind: AsmErrKind::Parse(err.kind), loc: err.loc }
    }
}

/// Parses a signed or unsigned integer with C-style radix prefixes,
/// returning its two's-complement 64-bit value.
///
/// This is the numeric half of every backend's argument translation.
pub fn parse_integer(text: &str) -> Result<u64, TranslateErr> {
    if text.is_empty() {
        return Err(TranslateErr::Empty);
    }

    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let magnitude = crate::parse::parse_unsigned(digits, 64)
        .ok_or_else(|| TranslateErr::BadNumber(text.to_string()))?;

    match negative {
        true => Ok(magnitude.wrapping_neg()),
        false => Ok(magnitude),
    }
}

/// Translates one argument: label addresses take precedence, everything
/// else goes through the backend's `translate` callback.
pub fn translate_argument(
    arg: &str,
    labels: &HashMap<String, u64>,
    translate: &impl Fn(&str) -> Result<u64, TranslateErr>,
) -> Result<u64, TranslateErr> {
    match labels.get(arg) {
        Some(&value) => Ok(value),
        None => translate(arg),
    }
}

/// Resolves a token stream into addressed tokens and debug symbols.
///
/// `process` is called once per instruction during the layout pass and
/// must set [`Instruction::size`]; `translate` converts argument strings
/// that are not labels into numbers during the second pass.
///
/// # Example
/// ```
/// use menagerie::asm::{parse_integer, resolve_tokens, ResolvedKind};
/// use menagerie::parse::tokenize_source;
///
/// let tokens = tokenize_source("demo.asm", "top: word 2, top").unwrap();
/// let (resolved, debug) = resolve_tokens(
///     tokens,
///     |i| { i.size = 4; Ok(()) },
///     parse_integer,
/// ).unwrap();
///
/// assert_eq!(resolved[0].address, 0);
/// assert_eq!(resolved[0].kind, ResolvedKind::Instruction {
///     mnemonic: "word".to_string(),
///     args: vec![2, 0],  // `top` resolved to address 0
/// });
/// assert_eq!(debug[0].label.as_deref(), Some("top"));
/// ```
pub fn resolve_tokens(
    tokens: Vec<Token>,
    process: impl FnMut(&mut Instruction) -> Result<(), AsmErr>,
    translate: impl Fn(&str) -> Result<u64, TranslateErr>,
) -> Result<(Vec<ResolvedToken>, Vec<DebugToken>), AsmErr> {
    resolve_tokens_at(tokens, 0, process, translate)
}

/// [`resolve_tokens`] with the layout starting at `origin` instead of 0.
///
/// Backends whose programs load at a text base (the 6502's 0x8000) pass
/// it here so that labels resolve to the addresses the program will
/// actually occupy.
pub fn resolve_tokens_at(
    tokens: Vec<Token>,
    origin: u64,
    mut process: impl FnMut(&mut Instruction) -> Result<(), AsmErr>,
    translate: impl Fn(&str) -> Result<u64, TranslateErr>,
) -> Result<(Vec<ResolvedToken>, Vec<DebugToken>), AsmErr> {
    let mut resolved: Vec<ResolvedToken> = Vec::new();
    let mut labels: HashMap<String, u64> = HashMap::new();
    let mut reverse_labels: HashMap<u64, String> = HashMap::new();
    // Raw argument strings per instruction, translated in pass two once
    // every label is known.
    let mut pending: Vec<(usize, Vec<String>)> = Vec::new();
    let mut address: u64 = origin;

    // Pass one: layout.
    let mut iter = tokens.into_iter().peekable();
    while let Some(token) = iter.next() {
        match token.kind {
            TokenKind::Arg(_) => {
                unreachable!("argument token without a preceding instruction; this is a bug in the tokenizer")
            }
            TokenKind::Label(name) => {
                if labels.contains_key(&name) {
                    return Err(AsmErr::new(AsmErrKind::DuplicateLabel(name), token.loc));
                }
                reverse_labels.insert(address, name.clone());
                labels.insert(name, address);
            }
            TokenKind::Literal(bytes) => {
                let len = bytes.len() as u64;
                resolved.push(ResolvedToken {
                    kind: ResolvedKind::Literal(bytes),
                    address,
                    loc: token.loc,
                    reserved: 0,
                });
                address += len;
            }
            TokenKind::Instruction(mnemonic) => {
                let mut args = Vec::new();
                while matches!(iter.peek(), Some(Token { kind: TokenKind::Arg(_), .. })) {
                    let Some(Token { kind: TokenKind::Arg(arg), .. }) = iter.next() else {
                        unreachable!()
                    };
                    args.push(arg);
                }

                let mut instruction = Instruction {
                    mnemonic,
                    args,
                    loc: token.loc,
                    size: 0,
                    reserved: 0,
                };
                process(&mut instruction)?;

                pending.push((resolved.len(), instruction.args));
                resolved.push(ResolvedToken {
                    kind: ResolvedKind::Instruction {
                        mnemonic: instruction.mnemonic,
                        args: Vec::new(),
                    },
                    address,
                    loc: instruction.loc,
                    reserved: instruction.reserved,
                });
                address += instruction.size;
            }
        }
    }

    // Pass two: argument translation and the debug stream. The debug
    // stream comes out sorted by address because the resolved tokens are.
    let mut debug = Vec::with_capacity(pending.len());
    for (index, raw_args) in pending {
        let token = &mut resolved[index];
        let ResolvedKind::Instruction { mnemonic, args } = &mut token.kind else {
            unreachable!("pending arguments recorded for a non-instruction token")
        };

        debug.push(DebugToken {
            loc: token.loc.clone(),
            address: token.address,
            label: reverse_labels.get(&token.address).cloned(),
            mnemonic: mnemonic.clone(),
            args: raw_args.clone(),
        });

        for arg in raw_args {
            let value = translate_argument(&arg, &labels, &translate).map_err(|err| {
                AsmErr::new(AsmErrKind::Translate { arg, err }, token.loc.clone())
            })?;
            args.push(value);
        }
    }

    Ok((resolved, debug))
}

/// [`resolve_tokens`] for architectures where every instruction encodes
/// to the same number of bytes.
pub fn resolve_tokens_fixed(
    tokens: Vec<Token>,
    size: u64,
    translate: impl Fn(&str) -> Result<u64, TranslateErr>,
) -> Result<(Vec<ResolvedToken>, Vec<DebugToken>), AsmErr> {
    resolve_tokens(
        tokens,
        |instruction| {
            instruction.size = size;
            Ok(())
        },
        translate,
    )
}
