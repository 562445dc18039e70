//! Generalized-operation signature parsing.
//!
//! A signature string like `"(m?,n),(n,p?)->(m?,p?)"` declares, per operand,
//! the *core* dimensions the kernel consumes directly (everything else is
//! broadcast). Parsing produces a [`CoreSignature`] table built once per
//! operation and reused across calls: per-operand core-dimension counts and
//! offsets into a shared flat index list, plus one entry per distinct named
//! dimension carrying its frozen size (for integer literals), whether its
//! size is inferred from operands, and whether a trailing `?` marks it
//! ignorable (allowed to be entirely absent from an under-ranked operand).

use crate::{Result, UFuncError};

const SIZE_INFERRED: u8 = 1;
const CAN_IGNORE: u8 = 2;

/// Parsed core-dimension table of a generalized operation.
#[derive(Debug, Clone)]
pub struct CoreSignature {
    signature: String,
    nin: usize,
    nout: usize,
    /// Number of core dimensions of each operand (inputs then outputs).
    core_num_dims: Vec<usize>,
    /// Offset of each operand's run inside `core_dim_ixs`.
    core_offsets: Vec<usize>,
    /// Flat list of distinct-dimension indices, one per declared core dim.
    core_dim_ixs: Vec<usize>,
    /// One entry per distinct dimension: the literal name text.
    dim_names: Vec<String>,
    /// Frozen size for integer-literal dims; `None` until inferred.
    dim_sizes: Vec<Option<usize>>,
    dim_flags: Vec<u8>,
    enabled: bool,
}

impl CoreSignature {
    /// Parse a signature for an operation with `nin` inputs and `nout`
    /// outputs. Errors carry the byte offset of the offending character and
    /// the full signature text.
    pub fn parse(nin: usize, nout: usize, signature: &str) -> Result<Self> {
        Parser {
            bytes: signature.as_bytes(),
            signature,
            pos: 0,
        }
        .parse(nin, nout)
    }

    pub fn text(&self) -> &str {
        &self.signature
    }

    /// False when every operand declared `()`: the operation degenerates to
    /// plain elementwise and the signature machinery is disabled.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn nin(&self) -> usize {
        self.nin
    }

    pub fn nout(&self) -> usize {
        self.nout
    }

    pub fn nop(&self) -> usize {
        self.nin + self.nout
    }

    /// Number of core dimensions declared by operand `op`.
    pub fn num_core_dims(&self, op: usize) -> usize {
        self.core_num_dims[op]
    }

    /// Distinct-dimension indices declared by operand `op`, in order.
    pub fn dim_indices(&self, op: usize) -> &[usize] {
        let start = self.core_offsets[op];
        &self.core_dim_ixs[start..start + self.core_num_dims[op]]
    }

    /// Number of distinct named dimensions in the signature.
    pub fn num_distinct_dims(&self) -> usize {
        self.dim_names.len()
    }

    pub fn dim_name(&self, ix: usize) -> &str {
        &self.dim_names[ix]
    }

    /// Frozen size of distinct dimension `ix` (integer literals only).
    pub fn frozen_size(&self, ix: usize) -> Option<usize> {
        if self.dim_flags[ix] & SIZE_INFERRED != 0 {
            None
        } else {
            self.dim_sizes[ix]
        }
    }

    pub fn size_inferred(&self, ix: usize) -> bool {
        self.dim_flags[ix] & SIZE_INFERRED != 0
    }

    pub fn can_ignore(&self, ix: usize) -> bool {
        self.dim_flags[ix] & CAN_IGNORE != 0
    }

    /// Largest core-dimension count over all operands.
    pub fn max_core_dims(&self) -> usize {
        self.core_num_dims.iter().copied().max().unwrap_or(0)
    }
}

struct Parser<'a> {
    bytes: &'a [u8],
    signature: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn error(&self, message: &'static str) -> UFuncError {
        UFuncError::SignatureParse {
            message,
            position: self.pos,
            signature: self.signature.to_string(),
        }
    }

    fn skip_white_space(&mut self) {
        while matches!(self.bytes.get(self.pos), Some(b' ') | Some(b'\t')) {
            self.pos += 1;
        }
    }

    fn peek(&self) -> u8 {
        self.bytes.get(self.pos).copied().unwrap_or(0)
    }

    fn parse(mut self, nin: usize, nout: usize) -> Result<CoreSignature> {
        let nop = nin + nout;
        let mut sig = CoreSignature {
            signature: self.signature.to_string(),
            nin,
            nout,
            core_num_dims: Vec::with_capacity(nop),
            core_offsets: Vec::with_capacity(nop),
            core_dim_ixs: Vec::new(),
            dim_names: Vec::new(),
            dim_sizes: Vec::new(),
            dim_flags: Vec::new(),
            enabled: true,
        };
        let mut var_texts: Vec<&'a str> = Vec::new();

        self.skip_white_space();
        while self.pos < self.bytes.len() {
            let cur_arg = sig.core_num_dims.len();
            if cur_arg == nin {
                if self.peek() != b'-' || self.bytes.get(self.pos + 1) != Some(&b'>') {
                    return Err(self.error("expect '->'"));
                }
                self.pos += 2;
                self.skip_white_space();
            }
            if self.peek() != b'(' {
                return Err(self.error("expect '('"));
            }
            self.pos += 1;
            self.skip_white_space();

            let offset = sig.core_dim_ixs.len();
            let mut nd = 0usize;
            while self.peek() != b')' {
                if self.pos >= self.bytes.len() {
                    return Err(self.error("unexpected end of signature string"));
                }
                let (token, frozen_size, can_ignore) = self.next_dim_token()?;
                let ix = self.intern_dim(&mut sig, &mut var_texts, token, frozen_size, can_ignore)?;
                sig.core_dim_ixs.push(ix);
                nd += 1;
                self.skip_white_space();
                match self.peek() {
                    b',' => {
                        self.pos += 1;
                        self.skip_white_space();
                        if self.peek() == b')' {
                            return Err(self.error("',' must not be followed by ')'"));
                        }
                    }
                    b')' => {}
                    _ => return Err(self.error("expect ',' or ')'")),
                }
            }
            sig.core_num_dims.push(nd);
            sig.core_offsets.push(offset);
            self.pos += 1; // consume ')'
            self.skip_white_space();

            let cur_arg = sig.core_num_dims.len();
            if cur_arg != nin && cur_arg != nop {
                if self.peek() != b',' {
                    return Err(self.error("expect ','"));
                }
                self.pos += 1;
                self.skip_white_space();
            }
        }
        if sig.core_num_dims.len() != nop {
            return Err(self.error("incomplete signature: not all arguments found"));
        }
        if sig.core_dim_ixs.is_empty() {
            sig.enabled = false;
        }
        Ok(sig)
    }

    /// Consume one dimension token: a name (alphanumeric/underscore) or a
    /// positive integer literal, either optionally suffixed by `?`.
    /// Returns (token text without `?`, frozen size, ignorable flag).
    fn next_dim_token(&mut self) -> Result<(&'a str, Option<usize>, bool)> {
        let start = self.pos;
        let first = self.peek();
        let frozen_size = if first.is_ascii_alphabetic() || first == b'_' {
            None
        } else {
            let mut end = self.pos;
            while self.bytes.get(end).is_some_and(|b| b.is_ascii_digit()) {
                end += 1;
            }
            let text = &self.signature[self.pos..end];
            let size: usize = text
                .parse()
                .map_err(|_| self.error("expect dimension name or non-zero frozen size"))?;
            if size == 0 {
                return Err(self.error("expect dimension name or non-zero frozen size"));
            }
            Some(size)
        };
        let mut end = start;
        while self
            .bytes
            .get(end)
            .is_some_and(|b| b.is_ascii_alphanumeric() || *b == b'_')
        {
            end += 1;
        }
        let token = &self.signature[start..end];
        if token.is_empty() {
            return Err(self.error("expect dimension name or non-zero frozen size"));
        }
        let can_ignore = self.bytes.get(end) == Some(&b'?');
        self.pos = if can_ignore { end + 1 } else { end };
        Ok((token, frozen_size, can_ignore))
    }

    /// Look up or insert a distinct dimension. Named dims match by literal
    /// text; frozen-size dims match by numeric equality.
    fn intern_dim(
        &self,
        sig: &mut CoreSignature,
        var_texts: &mut Vec<&'a str>,
        token: &'a str,
        frozen_size: Option<usize>,
        can_ignore: bool,
    ) -> Result<usize> {
        let found = (0..sig.dim_names.len()).find(|&ix| match frozen_size {
            Some(size) => !sig.size_inferred(ix) && sig.dim_sizes[ix] == Some(size),
            None => var_texts[ix] == token,
        });
        match found {
            Some(ix) => {
                if can_ignore && !sig.can_ignore(ix) {
                    return Err(self.error("? cannot be used, name already seen without ?"));
                }
                if !can_ignore && sig.can_ignore(ix) {
                    return Err(self.error("? must be used, name already seen with ?"));
                }
                Ok(ix)
            }
            None => {
                let ix = sig.dim_names.len();
                var_texts.push(token);
                sig.dim_names.push(token.to_string());
                sig.dim_sizes.push(frozen_size);
                let mut flags = 0u8;
                if frozen_size.is_none() {
                    flags |= SIZE_INFERRED;
                }
                if can_ignore {
                    flags |= CAN_IGNORE;
                }
                sig.dim_flags.push(flags);
                Ok(ix)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_matmul_signature() {
        let sig = CoreSignature::parse(2, 1, "(m,n),(n,p)->(m,p)").unwrap();
        assert!(sig.enabled());
        assert_eq!(sig.num_core_dims(0), 2);
        assert_eq!(sig.num_core_dims(1), 2);
        assert_eq!(sig.num_core_dims(2), 2);
        assert_eq!(sig.num_distinct_dims(), 3);
        assert_eq!(sig.dim_indices(0), &[0, 1]);
        assert_eq!(sig.dim_indices(1), &[1, 2]);
        assert_eq!(sig.dim_indices(2), &[0, 2]);
        assert!(sig.size_inferred(0));
    }

    #[test]
    fn test_parse_with_spaces_and_tabs() {
        let sig = CoreSignature::parse(2, 1, " ( i ),\t( i ) -> ( ) ").unwrap();
        assert_eq!(sig.num_core_dims(0), 1);
        assert_eq!(sig.num_core_dims(1), 1);
        assert_eq!(sig.num_core_dims(2), 0);
        assert_eq!(sig.dim_indices(0), sig.dim_indices(1));
    }

    #[test]
    fn test_frozen_size_matched_numerically() {
        let sig = CoreSignature::parse(2, 1, "(3),(3)->()").unwrap();
        assert_eq!(sig.num_distinct_dims(), 1);
        assert_eq!(sig.frozen_size(0), Some(3));
        assert!(!sig.size_inferred(0));
    }

    #[test]
    fn test_trivial_signature_disables_core() {
        let sig = CoreSignature::parse(2, 1, "(),()->()").unwrap();
        assert!(!sig.enabled());
    }

    #[test]
    fn test_flexible_dims() {
        let sig = CoreSignature::parse(2, 1, "(m?,n),(n,p?)->(m?,p?)").unwrap();
        let m = sig.dim_indices(0)[0];
        let n = sig.dim_indices(0)[1];
        let p = sig.dim_indices(1)[1];
        assert!(sig.can_ignore(m));
        assert!(!sig.can_ignore(n));
        assert!(sig.can_ignore(p));
    }

    #[test]
    fn test_inconsistent_ignorable_flag() {
        let err = CoreSignature::parse(2, 1, "(m,n),(n?,p)->(m,p)").unwrap_err();
        match err {
            UFuncError::SignatureParse { message, .. } => {
                assert!(message.contains("name already seen without ?"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_parse_errors_carry_position() {
        let err = CoreSignature::parse(2, 1, "(i),(i)->").unwrap_err();
        match err {
            UFuncError::SignatureParse {
                message,
                position,
                signature,
            } => {
                assert_eq!(message, "expect '('");
                assert_eq!(position, 9);
                assert_eq!(signature, "(i),(i)->");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let err = CoreSignature::parse(2, 1, "(i),(i)").unwrap_err();
        assert!(matches!(err, UFuncError::SignatureParse { .. }));

        let err = CoreSignature::parse(2, 1, "(0),(i)->()").unwrap_err();
        assert!(matches!(err, UFuncError::SignatureParse { .. }));

        let err = CoreSignature::parse(2, 1, "(i,),(i)->()").unwrap_err();
        match err {
            UFuncError::SignatureParse { message, .. } => {
                assert_eq!(message, "',' must not be followed by ')'");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_wrong_operand_count() {
        let err = CoreSignature::parse(3, 1, "(i),(i)->()").unwrap_err();
        assert!(matches!(err, UFuncError::SignatureParse { .. }));
    }
}
