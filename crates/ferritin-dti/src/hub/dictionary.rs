//! fairseq-style symbol table.
//!
//! Four special symbols come first, then one entry per `dict.txt` line
//! (`<symbol> <count>`), then `<mask>`.
use crate::error::{DtiError, Result};
use itertools::Itertools;
use std::collections::HashMap;
use std::io::BufRead;
use std::path::Path;

pub const BOS: &str = "<s>";
pub const PAD: &str = "<pad>";
pub const EOS: &str = "</s>";
pub const UNK: &str = "<unk>";
pub const MASK: &str = "<mask>";

const OVERWRITE_FLAG: &str = "#fairseq:overwrite";

#[derive(Debug, Clone, PartialEq)]
pub struct Dictionary {
    symbols: Vec<String>,
    counts: Vec<u64>,
    indices: HashMap<String, u32>,
    bos: u32,
    pad: u32,
    eos: u32,
    unk: u32,
    mask: Option<u32>,
}

impl Default for Dictionary {
    fn default() -> Self {
        Self::new()
    }
}

impl Dictionary {
    /// Only the special symbols `<s>`, `<pad>`, `</s>`, `<unk>`.
    pub fn new() -> Self {
        let mut dict = Self {
            symbols: Vec::new(),
            counts: Vec::new(),
            indices: HashMap::new(),
            bos: 0,
            pad: 0,
            eos: 0,
            unk: 0,
            mask: None,
        };
        dict.bos = dict.add_symbol(BOS, 1);
        dict.pad = dict.add_symbol(PAD, 1);
        dict.eos = dict.add_symbol(EOS, 1);
        dict.unk = dict.add_symbol(UNK, 1);
        dict
    }

    /// Reads a `dict.txt` file and appends `<mask>`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(std::io::BufReader::new(file))
    }

    pub fn from_reader(reader: impl BufRead) -> Result<Self> {
        let mut dict = Self::new();
        dict.add_from_reader(reader)?;
        dict.add_mask();
        Ok(dict)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Self::from_reader(content.as_bytes())
    }

    fn add_from_reader(&mut self, reader: impl BufRead) -> Result<()> {
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            let bad_line = || DtiError::Dictionary {
                line: line_no + 1,
                content: line.to_string(),
            };
            let (mut rest, mut last) = line.rsplit_once(' ').ok_or_else(bad_line)?;
            let overwrite = last == OVERWRITE_FLAG;
            if overwrite {
                (rest, last) = rest.rsplit_once(' ').ok_or_else(bad_line)?;
            }
            let count: u64 = last.parse().map_err(|_| bad_line())?;
            match self.indices.get(rest).copied() {
                Some(idx) if overwrite => self.counts[idx as usize] = count,
                Some(_) => {
                    return Err(DtiError::Dictionary {
                        line: line_no + 1,
                        content: format!("duplicate symbol '{rest}'"),
                    })
                }
                None => {
                    self.add_symbol(rest, count);
                }
            }
        }
        Ok(())
    }

    /// Index of `symbol`, adding it (or bumping its count) as needed.
    pub fn add_symbol(&mut self, symbol: &str, count: u64) -> u32 {
        if let Some(&idx) = self.indices.get(symbol) {
            self.counts[idx as usize] += count;
            return idx;
        }
        let idx = self.symbols.len() as u32;
        self.symbols.push(symbol.to_string());
        self.counts.push(count);
        self.indices.insert(symbol.to_string(), idx);
        idx
    }

    pub fn add_mask(&mut self) -> u32 {
        let idx = self.add_symbol(MASK, 1);
        self.mask = Some(idx);
        idx
    }

    /// Index of `symbol`, or `<unk>` when it is not in the table.
    pub fn index(&self, symbol: &str) -> u32 {
        self.indices.get(symbol).copied().unwrap_or(self.unk)
    }

    pub fn symbol(&self, idx: u32) -> Option<&str> {
        self.symbols.get(idx as usize).map(|s| s.as_str())
    }

    pub fn count(&self, idx: u32) -> Option<u64> {
        self.counts.get(idx as usize).copied()
    }

    /// Whitespace-split `line` mapped to indices. No end-of-sentence is appended.
    pub fn encode_line(&self, line: &str) -> Vec<u32> {
        line.split_whitespace().map(|s| self.index(s)).collect()
    }

    /// Space-joined symbols with `</s>` and `<pad>` dropped.
    pub fn string(&self, tokens: &[u32]) -> String {
        tokens
            .iter()
            .filter(|&&t| t != self.eos && t != self.pad)
            .map(|&t| self.symbol(t).unwrap_or(UNK))
            .join(" ")
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
    pub fn bos(&self) -> u32 {
        self.bos
    }
    pub fn pad(&self) -> u32 {
        self.pad
    }
    pub fn eos(&self) -> u32 {
        self.eos
    }
    pub fn unk(&self) -> u32 {
        self.unk
    }
    pub fn mask(&self) -> Option<u32> {
        self.mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_special_symbols_come_first() {
        let dict = Dictionary::parse("C 10\nO 5\n").unwrap();
        assert_eq!((dict.bos(), dict.pad(), dict.eos(), dict.unk()), (0, 1, 2, 3));
        assert_eq!(dict.index("C"), 4);
        assert_eq!(dict.index("O"), 5);
        assert_eq!(dict.mask(), Some(6));
        assert_eq!(dict.len(), 7);
        assert_eq!(dict.count(4), Some(10));
    }

    #[test]
    fn test_encode_and_string() {
        let dict = Dictionary::parse("C 10\nO 5\n").unwrap();
        let tokens = dict.encode_line("<s> C O N </s>");
        assert_eq!(tokens, vec![0, 4, 5, 3, 2]);
        assert_eq!(dict.string(&tokens), "<s> C O <unk>");
    }

    #[test]
    fn test_bad_lines() {
        assert!(matches!(
            Dictionary::parse("C ten"),
            Err(DtiError::Dictionary { line: 1, .. })
        ));
        assert!(Dictionary::parse("C 1\nC 2").is_err());
        let dict = Dictionary::parse("C 1\nC 2 #fairseq:overwrite").unwrap();
        assert_eq!(dict.count(4), Some(2));
    }
}
