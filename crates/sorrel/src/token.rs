//! Byte-level tokenizer with group gluing and heredoc support.
//!
//! `next_token` produces every token, including whitespace and comments; the
//! evaluator uses the `*_sig` variants which skip the insignificant ones.
//! After scanning an opening `(`, `[`, or `{`, the tokenizer re-scans (with
//! full string/comment/heredoc awareness) to the matching closer and returns
//! one group token whose adjusted inner range excludes the delimiters and
//! surrounding whitespace. Heredocs get the same treatment with their own
//! trimming rules.
//!
//! Tokenization failures never allocate: the error message is a static
//! string and the failed token's type is [`TokType::Err`].

/// Operator symbols, one per multi- or single-byte operator form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpSym {
    Comma,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    PlusPlus,
    MinusMinus,
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    PercentAssign,
    Assign,
    ColonAssign,
    EqEq,
    NotEq,
    EqEqEq,
    NotEqEq,
    Lt,
    Gt,
    Le,
    Ge,
    Shl,
    Shr,
    ShlAssign,
    ShrAssign,
    AmpAmp,
    PipePipe,
    PipePipePipe,
    Amp,
    Pipe,
    Caret,
    AmpAssign,
    PipeAssign,
    CaretAssign,
    Bang,
    Tilde,
    Question,
    Colon,
    QuestionColon,
    QuestionDot,
    Dot,
    DotDot,
    DotHash,
    Arrow,
    FatArrow,
    ColonColon,
    Hash,
    EqTilde,
    BangTilde,
}

impl OpSym {
    /// The source spelling of this operator.
    pub fn sym(self) -> &'static str {
        OP_TABLE
            .iter()
            .find(|(_, op)| *op == self)
            .map(|(s, _)| *s)
            .expect("every OpSym appears in OP_TABLE")
    }
}

/// Longest-match operator table: entries are ordered longest first and the
/// scanner takes the first prefix match.
const OP_TABLE: &[(&str, OpSym)] = &[
    ("===", OpSym::EqEqEq),
    ("!==", OpSym::NotEqEq),
    ("<<=", OpSym::ShlAssign),
    (">>=", OpSym::ShrAssign),
    ("|||", OpSym::PipePipePipe),
    ("==", OpSym::EqEq),
    ("!=", OpSym::NotEq),
    ("<=", OpSym::Le),
    (">=", OpSym::Ge),
    ("<<", OpSym::Shl),
    (">>", OpSym::Shr),
    ("&&", OpSym::AmpAmp),
    ("||", OpSym::PipePipe),
    ("?:", OpSym::QuestionColon),
    ("?.", OpSym::QuestionDot),
    ("=~", OpSym::EqTilde),
    ("!~", OpSym::BangTilde),
    ("=>", OpSym::FatArrow),
    ("->", OpSym::Arrow),
    ("..", OpSym::DotDot),
    (".#", OpSym::DotHash),
    ("++", OpSym::PlusPlus),
    ("--", OpSym::MinusMinus),
    ("+=", OpSym::PlusAssign),
    ("-=", OpSym::MinusAssign),
    ("*=", OpSym::StarAssign),
    ("/=", OpSym::SlashAssign),
    ("%=", OpSym::PercentAssign),
    ("&=", OpSym::AmpAssign),
    ("|=", OpSym::PipeAssign),
    ("^=", OpSym::CaretAssign),
    (":=", OpSym::ColonAssign),
    ("::", OpSym::ColonColon),
    (",", OpSym::Comma),
    ("+", OpSym::Plus),
    ("-", OpSym::Minus),
    ("*", OpSym::Star),
    ("/", OpSym::Slash),
    ("%", OpSym::Percent),
    ("<", OpSym::Lt),
    (">", OpSym::Gt),
    ("=", OpSym::Assign),
    ("!", OpSym::Bang),
    ("~", OpSym::Tilde),
    ("&", OpSym::Amp),
    ("|", OpSym::Pipe),
    ("^", OpSym::Caret),
    ("?", OpSym::Question),
    (":", OpSym::Colon),
    (".", OpSym::Dot),
    ("#", OpSym::Hash),
];

/// The closed set of token types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TokType {
    /// End of the tokenizer's input range.
    Eof,
    /// Hard expression terminator (`;`).
    Eox,
    /// A newline.
    Eol,
    /// Tokenization error; see [`Tokenizer::err_msg`].
    Err,
    Whitespace,
    /// `/* ... */` comment.
    CommentC,
    /// `// ...` comment.
    CommentCpp,
    /// `#!...` line at the very start of the input.
    Shebang,
    /// UTF-8 byte-order mark at the very start of the input.
    Bom,
    LitIntDec,
    LitIntHex,
    LitIntOct,
    LitIntBin,
    LitDouble,
    /// `'...'` literal; inner range excludes the quotes.
    SqString,
    /// `"..."` literal; inner range excludes the quotes.
    DqString,
    /// `<<<ID ... ID`; inner range is the trimmed body.
    Heredoc,
    Ident,
    /// `(...)`; inner range is the whitespace-trimmed content.
    ParenGroup,
    /// `[...]`.
    BracketGroup,
    /// `{...}`.
    BraceGroup,
    Op(OpSym),
}

impl TokType {
    /// Tokens the evaluator never sees.
    pub fn is_junk(self) -> bool {
        matches!(
            self,
            Self::Whitespace | Self::Eol | Self::CommentC | Self::CommentCpp | Self::Shebang | Self::Bom
        )
    }

    pub fn is_group(self) -> bool {
        matches!(self, Self::ParenGroup | Self::BracketGroup | Self::BraceGroup)
    }
}

/// One token: type, byte range, adjusted inner byte range, and the line and
/// column of its first byte (line 1-based, column 0-based).
#[derive(Debug, Clone, Copy)]
pub(crate) struct Token {
    pub ttype: TokType,
    pub begin: usize,
    pub end: usize,
    pub adj_begin: usize,
    pub adj_end: usize,
    pub line: u32,
    pub col: u32,
}

impl Token {
    fn eof(pos: usize, line: u32, col: u32) -> Self {
        Self {
            ttype: TokType::Eof,
            begin: pos,
            end: pos,
            adj_begin: pos,
            adj_end: pos,
            line,
            col,
        }
    }
}

/// Small LRU cache of `(byte position, line, column)` snapshots used to
/// recompute positions when the cursor moves non-linearly (sub-tokenizers).
#[derive(Debug, Default, Clone)]
struct LineColCache {
    entries: Vec<(usize, u32, u32)>,
}

impl LineColCache {
    const MAX: usize = 10;

    /// Best snapshot at or before `pos`.
    fn seed(&self, pos: usize) -> (usize, u32, u32) {
        self.entries
            .iter()
            .filter(|(p, _, _)| *p <= pos)
            .max_by_key(|(p, _, _)| *p)
            .copied()
            .unwrap_or((0, 1, 0))
    }

    fn note(&mut self, pos: usize, line: u32, col: u32) {
        if let Some(entry) = self.entries.iter_mut().find(|(p, _, _)| *p == pos) {
            *entry = (pos, line, col);
            return;
        }
        if self.entries.len() == Self::MAX {
            self.entries.remove(0);
        }
        self.entries.push((pos, line, col));
    }
}

/// The tokenizer over a byte range of a source string.
///
/// Sub-tokenizers (for group innards) share the same source string and use
/// absolute byte positions, so error positions stay consistent across
/// nesting levels.
#[derive(Debug, Clone)]
pub(crate) struct Tokenizer<'s> {
    src: &'s str,
    /// Inclusive scan start (also the shebang/BOM anchor for root tokenizers).
    begin: usize,
    /// Exclusive scan end.
    end: usize,
    pos: usize,
    line: u32,
    col: u32,
    cur: Token,
    /// The previous current token, restored by `putback`.
    prev: Token,
    /// Pre-consumed next token, set by lookahead and `putback`.
    pending: Option<Token>,
    lru: LineColCache,
    err: Option<&'static str>,
    /// True for tokenizers created via [`Tokenizer::sub`]; they skip
    /// shebang/BOM handling.
    is_sub: bool,
}

impl<'s> Tokenizer<'s> {
    pub fn new(src: &'s str) -> Self {
        let t = Token::eof(0, 1, 0);
        Self {
            src,
            begin: 0,
            end: src.len(),
            pos: 0,
            line: 1,
            col: 0,
            cur: t,
            prev: t,
            pending: None,
            lru: LineColCache::default(),
            err: None,
            is_sub: false,
        }
    }

    /// A tokenizer over `[begin, end)` of the same source, inheriting the
    /// position cache so line/column lookups stay cheap.
    pub fn sub(&self, begin: usize, end: usize) -> Tokenizer<'s> {
        let (line, col) = self.line_col_of(begin);
        let t = Token::eof(begin, line, col);
        Tokenizer {
            src: self.src,
            begin,
            end,
            pos: begin,
            line,
            col,
            cur: t,
            prev: t,
            pending: None,
            lru: self.lru.clone(),
            err: self.err,
            is_sub: true,
        }
    }

    pub fn src(&self) -> &'s str {
        self.src
    }

    /// Current cursor byte position (absolute).
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Exclusive end of this tokenizer's range (absolute).
    pub fn end(&self) -> usize {
        self.end
    }

    pub fn err_msg(&self) -> Option<&'static str> {
        self.err
    }

    /// Raw text of a token.
    pub fn text(&self, tok: &Token) -> &'s str {
        &self.src[tok.begin..tok.end]
    }

    /// Adjusted inner text (group/heredoc/string content).
    pub fn inner(&self, tok: &Token) -> &'s str {
        &self.src[tok.adj_begin..tok.adj_end]
    }

    /// Line and column of an arbitrary byte position, using the LRU cache.
    pub fn line_col_of(&self, pos: usize) -> (u32, u32) {
        let (mut p, mut line, mut col) = self.lru.seed(pos);
        while p < pos && p < self.src.len() {
            if self.src.as_bytes()[p] == b'\n' {
                line += 1;
                col = 0;
            } else {
                col += 1;
            }
            p += 1;
        }
        (line, col)
    }

    /// Consumes and returns one raw token (whitespace and comments included).
    pub fn next_token(&mut self) -> Token {
        self.prev = self.cur;
        if let Some(t) = self.pending.take() {
            self.cur = t;
            return t;
        }
        let t = self.scan();
        self.cur = t;
        t
    }

    /// Restores the previous current token; the clobbered token is replayed
    /// by the next `next_token` call. One level deep.
    pub fn putback(&mut self) {
        self.pending = Some(self.cur);
        self.cur = self.prev;
    }

    /// Consumes tokens until a significant one.
    pub fn next_sig(&mut self) -> Token {
        loop {
            let t = self.next_token();
            if !t.ttype.is_junk() {
                return t;
            }
        }
    }

    /// One-token lookahead over significant tokens.
    pub fn peek_sig(&mut self) -> Token {
        if let Some(t) = self.pending
            && !t.ttype.is_junk()
        {
            return t;
        }
        let saved_prev = self.prev;
        let saved_cur = self.cur;
        let t = self.next_sig();
        self.pending = Some(t);
        self.prev = saved_prev;
        self.cur = saved_cur;
        t
    }

    fn at_end(&self) -> bool {
        self.pos >= self.end
    }

    fn rest(&self) -> &'s str {
        &self.src[self.pos..self.end]
    }

    fn bump(&mut self, bytes: usize) {
        for b in self.src.as_bytes()[self.pos..self.pos + bytes].iter() {
            if *b == b'\n' {
                self.line += 1;
                self.col = 0;
            } else {
                self.col += 1;
            }
        }
        self.pos += bytes;
    }

    /// Jumps the cursor to an absolute position, recomputing line/column via
    /// the cache (used after consuming a multi-line group token).
    fn jump_to(&mut self, pos: usize) {
        self.lru.note(self.pos, self.line, self.col);
        let (line, col) = self.line_col_of(pos);
        self.pos = pos;
        self.line = line;
        self.col = col;
        self.lru.note(pos, line, col);
    }

    fn make(&self, ttype: TokType, begin: usize, line: u32, col: u32) -> Token {
        Token {
            ttype,
            begin,
            end: self.pos,
            adj_begin: begin,
            adj_end: self.pos,
            line,
            col,
        }
    }

    fn fail(&mut self, msg: &'static str, begin: usize, line: u32, col: u32) -> Token {
        self.err = Some(msg);
        Token {
            ttype: TokType::Err,
            begin,
            end: self.pos.max(begin),
            adj_begin: begin,
            adj_end: self.pos.max(begin),
            line,
            col,
        }
    }

    fn scan(&mut self) -> Token {
        if self.at_end() {
            return Token::eof(self.pos, self.line, self.col);
        }
        let begin = self.pos;
        let (line, col) = (self.line, self.col);
        let rest = self.rest();
        let bytes = rest.as_bytes();

        // BOM and shebang are only recognized at the very start of root input.
        if !self.is_sub && begin == self.begin {
            if rest.starts_with('\u{feff}') {
                self.bump('\u{feff}'.len_utf8());
                return self.make(TokType::Bom, begin, line, col);
            }
            if rest.starts_with("#!") {
                let len = rest.find('\n').unwrap_or(rest.len());
                self.bump(len);
                return self.make(TokType::Shebang, begin, line, col);
            }
        }

        match bytes[0] {
            b'\n' => {
                self.bump(1);
                self.make(TokType::Eol, begin, line, col)
            }
            b' ' | b'\t' | b'\r' => {
                let len = bytes
                    .iter()
                    .position(|b| !matches!(b, b' ' | b'\t' | b'\r'))
                    .unwrap_or(bytes.len());
                self.bump(len);
                self.make(TokType::Whitespace, begin, line, col)
            }
            b';' => {
                self.bump(1);
                self.make(TokType::Eox, begin, line, col)
            }
            b'/' if bytes.get(1) == Some(&b'/') => {
                let len = rest.find('\n').unwrap_or(rest.len());
                self.bump(len);
                self.make(TokType::CommentCpp, begin, line, col)
            }
            b'/' if bytes.get(1) == Some(&b'*') => match rest[2..].find("*/") {
                Some(i) => {
                    self.bump(2 + i + 2);
                    self.make(TokType::CommentC, begin, line, col)
                }
                None => {
                    self.bump(rest.len());
                    self.fail("unterminated /* comment", begin, line, col)
                }
            },
            b'\'' | b'"' => self.scan_string(begin, line, col),
            b'0'..=b'9' => self.scan_number(begin, line, col),
            b'(' | b'[' | b'{' => self.scan_group(begin, line, col),
            b')' | b']' | b'}' => {
                self.bump(1);
                self.fail("unbalanced closing bracket", begin, line, col)
            }
            b'<' if rest.starts_with("<<<") && !rest.starts_with("<<<=") => self.scan_heredoc(begin, line, col),
            b'A'..=b'Z' | b'a'..=b'z' | b'_' | 0x80.. => self.scan_ident(begin, line, col),
            _ => {
                for (sym, op) in OP_TABLE {
                    if rest.starts_with(sym) {
                        self.bump(sym.len());
                        return self.make(TokType::Op(*op), begin, line, col);
                    }
                }
                self.bump(1);
                self.fail("unrecognized byte", begin, line, col)
            }
        }
    }

    fn scan_ident(&mut self, begin: usize, line: u32, col: u32) -> Token {
        let bytes = self.rest().as_bytes();
        let mut len = 0;
        while len < bytes.len() {
            let b = bytes[len];
            let ok = b.is_ascii_alphanumeric() || b == b'_' || b >= 0x80;
            if !ok {
                break;
            }
            len += 1;
        }
        self.bump(len);
        self.make(TokType::Ident, begin, line, col)
    }

    fn scan_number(&mut self, begin: usize, line: u32, col: u32) -> Token {
        let rest = self.rest();
        let bytes = rest.as_bytes();
        if bytes[0] == b'0' && bytes.len() > 1 {
            let (ttype, digits): (TokType, fn(u8) -> bool) = match bytes[1] {
                b'x' | b'X' => (TokType::LitIntHex, |b: u8| b.is_ascii_hexdigit()),
                b'o' | b'O' => (TokType::LitIntOct, |b: u8| (b'0'..=b'7').contains(&b)),
                b'b' | b'B' => (TokType::LitIntBin, |b: u8| b == b'0' || b == b'1'),
                _ => (TokType::LitIntDec, |_| false),
            };
            if ttype != TokType::LitIntDec {
                let mut len = 2;
                while len < bytes.len() && digits(bytes[len]) {
                    len += 1;
                }
                if len == 2 {
                    self.bump(2);
                    return self.fail("malformed radix integer literal", begin, line, col);
                }
                self.bump(len);
                let mut t = self.make(ttype, begin, line, col);
                // Inner range excludes the radix prefix.
                t.adj_begin = begin + 2;
                return t;
            }
        }
        let mut len = 0;
        while len < bytes.len() && bytes[len].is_ascii_digit() {
            len += 1;
        }
        // A fractional part requires a digit after the dot; `1..2` and `1.x`
        // leave the dot for the operator scanner.
        let mut ttype = TokType::LitIntDec;
        if len + 1 < bytes.len() && bytes[len] == b'.' && bytes[len + 1].is_ascii_digit() {
            ttype = TokType::LitDouble;
            len += 1;
            while len < bytes.len() && bytes[len].is_ascii_digit() {
                len += 1;
            }
        }
        self.bump(len);
        self.make(ttype, begin, line, col)
    }

    fn scan_string(&mut self, begin: usize, line: u32, col: u32) -> Token {
        let bytes = self.rest().as_bytes();
        let quote = bytes[0];
        let mut i = 1;
        while i < bytes.len() {
            match bytes[i] {
                b'\\' if i + 1 < bytes.len() => i += 2,
                b if b == quote => {
                    self.bump(i + 1);
                    let mut t = self.make(
                        if quote == b'\'' { TokType::SqString } else { TokType::DqString },
                        begin,
                        line,
                        col,
                    );
                    t.adj_begin = begin + 1;
                    t.adj_end = t.end - 1;
                    return t;
                }
                _ => i += 1,
            }
        }
        self.bump(bytes.len());
        self.fail("unterminated string literal", begin, line, col)
    }

    /// Glues a balanced bracket span into one group token. The scan respects
    /// strings, comments, heredocs, and nested groups of every kind.
    fn scan_group(&mut self, begin: usize, line: u32, col: u32) -> Token {
        let opener = self.src.as_bytes()[begin];
        let ttype = match opener {
            b'(' => TokType::ParenGroup,
            b'[' => TokType::BracketGroup,
            _ => TokType::BraceGroup,
        };
        match find_matching(self.src, begin, self.end) {
            Ok(close) => {
                self.jump_to(close + 1);
                let inner = self.src[begin + 1..close].trim();
                let adj_begin = begin + 1 + (self.src[begin + 1..close].len() - self.src[begin + 1..close].trim_start().len());
                Token {
                    ttype,
                    begin,
                    end: close + 1,
                    adj_begin,
                    adj_end: adj_begin + inner.len(),
                    line,
                    col,
                }
            }
            Err(msg) => {
                self.jump_to(self.end);
                self.fail(msg, begin, line, col)
            }
        }
    }

    fn scan_heredoc(&mut self, begin: usize, line: u32, col: u32) -> Token {
        let rest = self.rest();
        let bytes = rest.as_bytes();
        let mut i = 3; // past `<<<`
        let strip_one = bytes.get(i) == Some(&b':');
        if strip_one {
            i += 1;
        }
        let (id_begin, id_end, quoted) = match bytes.get(i) {
            Some(&q @ (b'\'' | b'"')) => {
                let start = i + 1;
                let mut j = start;
                while j < bytes.len() && bytes[j] != q {
                    j += 1;
                }
                if j >= bytes.len() {
                    self.bump(rest.len());
                    return self.fail("unterminated heredoc identifier", begin, line, col);
                }
                (start, j, true)
            }
            Some(b) if b.is_ascii_alphanumeric() || *b == b'_' || *b >= 0x80 => {
                let start = i;
                let mut j = start;
                while j < bytes.len() {
                    let b = bytes[j];
                    if b.is_ascii_alphanumeric() || b == b'_' || b >= 0x80 {
                        j += 1;
                    } else {
                        break;
                    }
                }
                (start, j, false)
            }
            _ => {
                self.bump(3);
                return self.fail("malformed heredoc opener", begin, line, col);
            }
        };
        let id = &rest[id_begin..id_end];
        let body_start = if quoted { id_end + 1 } else { id_end };
        let Some(found) = rest[body_start..].find(id) else {
            self.bump(rest.len());
            return self.fail("unterminated heredoc", begin, line, col);
        };
        let body = &rest[body_start..body_start + found];
        let (lead, trail) = if strip_one {
            (
                usize::from(body.starts_with([' ', '\n'])),
                usize::from(body.len() > 1 && body.ends_with([' ', '\n'])),
            )
        } else {
            let trimmed_start = body.len() - body.trim_start().len();
            let trimmed_end = body.len() - body.trim_end().len();
            (trimmed_start, trimmed_end.min(body.len() - trimmed_start))
        };
        let tok_end = begin + body_start + found + id.len();
        let adj_begin = begin + body_start + lead;
        let adj_end = (begin + body_start + body.len()).saturating_sub(trail);
        self.jump_to(tok_end);
        Token {
            ttype: TokType::Heredoc,
            begin,
            end: tok_end,
            adj_begin,
            adj_end: adj_end.max(adj_begin),
            line,
            col,
        }
    }
}

/// Finds the closer matching the opener at `open_pos`, honoring strings,
/// comments, heredocs, and nested brackets of every kind.
fn find_matching(src: &str, open_pos: usize, end: usize) -> Result<usize, &'static str> {
    let bytes = src.as_bytes();
    let mut stack: smallvec::SmallVec<[u8; 16]> = smallvec::smallvec![bytes[open_pos]];
    let mut i = open_pos + 1;
    while i < end {
        match bytes[i] {
            b'(' | b'[' | b'{' => {
                stack.push(bytes[i]);
                i += 1;
            }
            closer @ (b')' | b']' | b'}') => {
                let opener = match closer {
                    b')' => b'(',
                    b']' => b'[',
                    _ => b'{',
                };
                if stack.pop() != Some(opener) {
                    return Err("mismatched closing bracket");
                }
                if stack.is_empty() {
                    return Ok(i);
                }
                i += 1;
            }
            q @ (b'\'' | b'"') => {
                i += 1;
                while i < end {
                    match bytes[i] {
                        b'\\' if i + 1 < end => i += 2,
                        b if b == q => {
                            i += 1;
                            break;
                        }
                        _ => i += 1,
                    }
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                while i < end && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => match src[i + 2..end].find("*/") {
                Some(j) => i += 2 + j + 2,
                None => return Err("unterminated /* comment in group"),
            },
            b'<' if src[i..end].starts_with("<<<") && !src[i..end].starts_with("<<<=") => {
                // Skip the entire heredoc so its body cannot unbalance us.
                let h = &src[i..end];
                let mut j = 3;
                if h.as_bytes().get(j) == Some(&b':') {
                    j += 1;
                }
                let (id, body_start) = match h.as_bytes().get(j) {
                    Some(&q @ (b'\'' | b'"')) => {
                        let start = j + 1;
                        let Some(close) = h[start..].find(q as char) else {
                            return Err("unterminated heredoc in group");
                        };
                        (&h[start..start + close], start + close + 1)
                    }
                    _ => {
                        let start = j;
                        let mut k = start;
                        let hb = h.as_bytes();
                        while k < hb.len() && (hb[k].is_ascii_alphanumeric() || hb[k] == b'_' || hb[k] >= 0x80) {
                            k += 1;
                        }
                        if k == start {
                            return Err("malformed heredoc opener in group");
                        }
                        (&h[start..k], k)
                    }
                };
                let Some(found) = h[body_start..].find(id) else {
                    return Err("unterminated heredoc in group");
                };
                i += body_start + found + id.len();
            }
            _ => i += 1,
        }
    }
    Err("unterminated group")
}

/// Applies the string escape rules to `raw`, appending to `out`.
///
/// `\u` takes exactly 4 hex digits and `\U` exactly 8; both must name a valid
/// code point. Unknown escapes keep their backslash.
pub(crate) fn unescape(raw: &str, out: &mut String) -> Result<(), &'static str> {
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let Some(esc) = chars.next() else {
            return Err("dangling backslash at end of string");
        };
        match esc {
            '0' => out.push('\0'),
            'b' => out.push('\u{8}'),
            't' => out.push('\t'),
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            'f' => out.push('\u{c}'),
            'v' => out.push('\u{b}'),
            '\\' => out.push('\\'),
            '\'' => out.push('\''),
            '"' => out.push('"'),
            'u' | 'U' => {
                let want = if esc == 'u' { 4 } else { 8 };
                let mut code: u32 = 0;
                for _ in 0..want {
                    let Some(h) = chars.next().and_then(|c| c.to_digit(16)) else {
                        return Err("malformed unicode escape");
                    };
                    code = (code << 4) | h;
                }
                let Some(decoded) = char::from_u32(code) else {
                    return Err("unicode escape is not a valid code point");
                };
                out.push(decoded);
            }
            other => {
                // Unknown escapes retain the backslash.
                out.push('\\');
                out.push(other);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig_types(src: &str) -> Vec<TokType> {
        let mut t = Tokenizer::new(src);
        let mut out = Vec::new();
        loop {
            let tok = t.next_sig();
            if tok.ttype == TokType::Eof {
                break;
            }
            out.push(tok.ttype);
            if tok.ttype == TokType::Err {
                break;
            }
        }
        out
    }

    #[test]
    fn scans_numbers_in_every_radix() {
        assert_eq!(
            sig_types("1 0x1F 0o17 0b101 1.5"),
            vec![
                TokType::LitIntDec,
                TokType::LitIntHex,
                TokType::LitIntOct,
                TokType::LitIntBin,
                TokType::LitDouble,
            ]
        );
    }

    #[test]
    fn dot_after_int_is_not_a_fraction_without_digits() {
        assert_eq!(
            sig_types("1.x"),
            vec![TokType::LitIntDec, TokType::Op(OpSym::Dot), TokType::Ident]
        );
    }

    #[test]
    fn longest_operator_match_wins() {
        assert_eq!(
            sig_types("=== == = <<= << |||"),
            vec![
                TokType::Op(OpSym::EqEqEq),
                TokType::Op(OpSym::EqEq),
                TokType::Op(OpSym::Assign),
                TokType::Op(OpSym::ShlAssign),
                TokType::Op(OpSym::Shl),
                TokType::Op(OpSym::PipePipePipe),
            ]
        );
    }

    #[test]
    fn groups_glue_balanced_spans() {
        let mut t = Tokenizer::new("( 1 + (2 * 3) )");
        let tok = t.next_sig();
        assert_eq!(tok.ttype, TokType::ParenGroup);
        assert_eq!(t.inner(&tok), "1 + (2 * 3)");
        assert_eq!(t.next_sig().ttype, TokType::Eof);
    }

    #[test]
    fn group_scan_ignores_brackets_in_strings_and_comments() {
        let mut t = Tokenizer::new("( \")\" /* ) */ )");
        let tok = t.next_sig();
        assert_eq!(tok.ttype, TokType::ParenGroup, "bracket bytes inside strings/comments are content");
    }

    #[test]
    fn deeply_nested_parens_scan_iteratively() {
        let depth = 10_000;
        let src = format!("{}1{}", "(".repeat(depth), ")".repeat(depth));
        let mut t = Tokenizer::new(&src);
        let tok = t.next_sig();
        assert_eq!(tok.ttype, TokType::ParenGroup);
        assert_eq!(tok.end, src.len());
    }

    #[test]
    fn unterminated_group_reports_at_opener() {
        let mut t = Tokenizer::new("(1 + 2");
        let tok = t.next_sig();
        assert_eq!(tok.ttype, TokType::Err);
        assert_eq!(tok.begin, 0, "error position must be the opener");
        assert_eq!(t.err_msg(), Some("unterminated group"));
    }

    #[test]
    fn heredoc_trims_all_whitespace_by_default() {
        let mut t = Tokenizer::new("<<<EOF hello EOF");
        let tok = t.next_sig();
        assert_eq!(tok.ttype, TokType::Heredoc);
        assert_eq!(t.inner(&tok), "hello");
    }

    #[test]
    fn heredoc_colon_strips_exactly_one() {
        let mut t = Tokenizer::new("<<<:EOF\n hello \nEOF");
        let tok = t.next_sig();
        assert_eq!(tok.ttype, TokType::Heredoc);
        assert_eq!(t.inner(&tok), " hello ");
    }

    #[test]
    fn heredoc_quoted_identifier() {
        let mut t = Tokenizer::new("<<<'END TAG' body 'END TAG'");
        let tok = t.next_sig();
        assert_eq!(tok.ttype, TokType::Heredoc);
        assert!(t.inner(&tok).contains("body"));
    }

    #[test]
    fn heredoc_without_close_fails_at_opener() {
        let mut t = Tokenizer::new("<<<EOF no close here");
        let tok = t.next_sig();
        assert_eq!(tok.ttype, TokType::Err);
        assert_eq!(tok.begin, 0);
        assert_eq!(t.err_msg(), Some("unterminated heredoc"));
    }

    #[test]
    fn putback_replays_the_current_token() {
        let mut t = Tokenizer::new("a b");
        let a = t.next_sig();
        assert_eq!(t.text(&a), "a");
        let b = t.next_sig();
        assert_eq!(t.text(&b), "b");
        t.putback();
        let b2 = t.next_sig();
        assert_eq!(t.text(&b2), "b");
    }

    #[test]
    fn peek_does_not_consume() {
        let mut t = Tokenizer::new("x = 1");
        let p = t.peek_sig();
        assert_eq!(p.ttype, TokType::Ident);
        let x = t.next_sig();
        assert_eq!(t.text(&x), "x");
        assert_eq!(t.next_sig().ttype, TokType::Op(OpSym::Assign));
    }

    #[test]
    fn line_and_column_track_newlines() {
        let mut t = Tokenizer::new("a\n  b");
        let a = t.next_sig();
        assert_eq!((a.line, a.col), (1, 0));
        let b = t.next_sig();
        assert_eq!((b.line, b.col), (2, 2));
    }

    #[test]
    fn sub_tokenizer_keeps_absolute_positions() {
        let src = "xx (\n b )";
        let mut t = Tokenizer::new(src);
        t.next_sig(); // xx
        let group = t.next_sig();
        assert_eq!(group.ttype, TokType::ParenGroup);
        let mut sub = t.sub(group.adj_begin, group.adj_end);
        let b = sub.next_sig();
        assert_eq!(sub.text(&b), "b");
        assert_eq!(b.line, 2, "positions inside groups are absolute");
    }

    #[test]
    fn shebang_and_bom_only_at_start() {
        assert_eq!(sig_types("#!/usr/bin/env sorrel\n1"), vec![TokType::LitIntDec]);
        let with_bom = "\u{feff}1";
        assert_eq!(sig_types(with_bom), vec![TokType::LitIntDec]);
    }

    #[test]
    fn unescape_handles_unicode_and_unknown_escapes() {
        let mut out = String::new();
        unescape(r"a\nA\U0001F600\q", &mut out).unwrap();
        assert_eq!(out, "a\nA😀\\q");
        let mut bad = String::new();
        assert!(unescape(r"\u12", &mut bad).is_err(), "\\u needs exactly 4 hex digits");
        assert!(unescape(r"\UDDDDDDDD", &mut String::new()).is_err(), "invalid code point");
    }

    #[test]
    fn string_inner_range_excludes_quotes() {
        let mut t = Tokenizer::new("'hi there'");
        let tok = t.next_sig();
        assert_eq!(tok.ttype, TokType::SqString);
        assert_eq!(t.inner(&tok), "hi there");
    }

    #[test]
    fn unbalanced_closer_is_an_error() {
        let types = sig_types("1 )");
        assert_eq!(types, vec![TokType::LitIntDec, TokType::Err]);
    }
}
