use std::io::{BufRead, ErrorKind};
use std::ops::Range;

use crate::error::{ReconError, ReconResult};

/// Field-at-a-time access to the body of a sample file.
///
/// Each record is fetched whole by `begin_record`, so field-count and truncation errors
/// surface before any of its fields are handed out.
pub(crate) trait FormatReader {
    /// Fetches the next record. `Ok(false)` at a clean end of input.
    fn begin_record(&mut self) -> ReconResult<bool>;
    fn read_float(&mut self) -> ReconResult<f32>;
    fn read_int(&mut self) -> ReconResult<i32>;
    /// Line number (ascii) or record position past the header (binary) for diagnostics.
    fn location(&self) -> usize;
}

pub(crate) struct AsciiFormat<R> {
    data: R,
    fields: usize,
    line: String,
    line_no: usize,
    tokens: Vec<Range<usize>>,
    next: usize,
}

impl<R: BufRead> AsciiFormat<R> {
    pub fn new(data: R, fields: usize, header_lines: usize) -> Self {
        AsciiFormat {
            data,
            fields,
            line: String::new(),
            line_no: header_lines,
            tokens: vec![],
            next: 0,
        }
    }

    fn token(&mut self) -> &str {
        let range = self.tokens[self.next].clone();
        self.next += 1;
        &self.line[range]
    }
}

impl<R: BufRead> FormatReader for AsciiFormat<R> {
    fn begin_record(&mut self) -> ReconResult<bool> {
        loop {
            self.line.clear();
            if self.data.read_line(&mut self.line)? == 0 {
                return Ok(false);
            }
            self.line_no += 1;

            self.tokens.clear();
            self.next = 0;
            let base = self.line.as_ptr() as usize;
            for word in self.line.split_whitespace() {
                let start = word.as_ptr() as usize - base;
                self.tokens.push(start..start + word.len());
            }
            if self.tokens.is_empty() {
                continue;
            }
            if self.tokens.len() != self.fields {
                return Err(ReconError::load(
                    self.line_no,
                    format!("expected {} fields, found {}", self.fields, self.tokens.len()),
                ));
            }
            return Ok(true);
        }
    }

    fn read_float(&mut self) -> ReconResult<f32> {
        let line_no = self.line_no;
        let token = self.token();
        token
            .parse()
            .map_err(|_| ReconError::load(line_no, format!("`{token}` is not a number")))
    }

    fn read_int(&mut self) -> ReconResult<i32> {
        let line_no = self.line_no;
        let token = self.token();
        token
            .parse()
            .map_err(|_| ReconError::load(line_no, format!("`{token}` is not an integer")))
    }

    fn location(&self) -> usize {
        self.line_no
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Endian {
    Little,
    Big,
}

impl Endian {
    pub fn decode(self, word: u32) -> u32 {
        match self {
            Endian::Little => u32::from_le(word),
            Endian::Big => u32::from_be(word),
        }
    }

    pub fn encode(self, word: u32) -> u32 {
        match self {
            Endian::Little => word.to_le(),
            Endian::Big => word.to_be(),
        }
    }
}

/// Fixed-size records of 4-byte words.
pub(crate) struct BinaryFormat<R> {
    data: R,
    endian: Endian,
    words: Vec<u32>,
    next: usize,
    record: usize,
    header_lines: usize,
}

impl<R: BufRead> BinaryFormat<R> {
    pub fn new(data: R, endian: Endian, fields: usize, header_lines: usize) -> Self {
        BinaryFormat {
            data,
            endian,
            words: vec![0; fields],
            next: 0,
            record: 0,
            header_lines,
        }
    }

    fn word(&mut self) -> u32 {
        let word = self.endian.decode(self.words[self.next]);
        self.next += 1;
        word
    }
}

impl<R: BufRead> FormatReader for BinaryFormat<R> {
    fn begin_record(&mut self) -> ReconResult<bool> {
        if self.data.fill_buf()?.is_empty() {
            return Ok(false);
        }
        self.record += 1;
        self.next = 0;
        match self.data.read_exact(bytemuck::cast_slice_mut(&mut self.words)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(ReconError::load(
                self.location(),
                format!("binary body truncated inside sample {}", self.record),
            )),
            Err(e) => Err(e.into()),
        }
    }

    fn read_float(&mut self) -> ReconResult<f32> {
        Ok(f32::from_bits(self.word()))
    }

    fn read_int(&mut self) -> ReconResult<i32> {
        Ok(self.word() as i32)
    }

    fn location(&self) -> usize {
        self.header_lines + self.record
    }
}
