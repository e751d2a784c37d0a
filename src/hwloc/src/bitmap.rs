//! Cpuset bitmaps.
//!
//! A [`Cpuset`] is a value type naming a set of logical-processor indices.
//! Two string renderings exist: the list form (`0-3,8`) used on the wire and
//! in sysfs, and the mask form (`0xff,0xffffffff`) used when rendering
//! bindings for humans.

use std::fmt;
use std::str::FromStr;

use qv_rc::{QvResult, ReturnCode};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

const WORD_BITS: u32 = 64;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Cpuset {
    // Invariant: no trailing zero words, so Eq/Hash see a canonical form.
    words: Vec<u64>,
}

impl Cpuset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ids<I: IntoIterator<Item = u32>>(ids: I) -> Self {
        let mut set = Self::new();
        for id in ids {
            set.set(id);
        }
        set
    }

    /// A contiguous range of processor ids, both ends inclusive.
    pub fn from_range(first: u32, last: u32) -> Self {
        Self::from_ids(first..=last)
    }

    pub fn set(&mut self, id: u32) {
        let word = (id / WORD_BITS) as usize;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1u64 << (id % WORD_BITS);
    }

    pub fn clear(&mut self, id: u32) {
        let word = (id / WORD_BITS) as usize;
        if word < self.words.len() {
            self.words[word] &= !(1u64 << (id % WORD_BITS));
            self.trim();
        }
    }

    pub fn is_set(&self, id: u32) -> bool {
        let word = (id / WORD_BITS) as usize;
        word < self.words.len() && self.words[word] & (1u64 << (id % WORD_BITS)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Number of ids in the set.
    pub fn weight(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    pub fn first(&self) -> Option<u32> {
        self.iter().next()
    }

    pub fn last(&self) -> Option<u32> {
        let (idx, word) = self
            .words
            .iter()
            .enumerate()
            .rev()
            .find(|(_, w)| **w != 0)?;
        Some(idx as u32 * WORD_BITS + (WORD_BITS - 1 - word.leading_zeros()))
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.words.iter().enumerate().flat_map(|(wi, &w)| {
            (0..WORD_BITS).filter_map(move |bit| {
                if w & (1u64 << bit) != 0 {
                    Some(wi as u32 * WORD_BITS + bit)
                } else {
                    None
                }
            })
        })
    }

    pub fn union_with(&mut self, other: &Cpuset) {
        if other.words.len() > self.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (dst, src) in self.words.iter_mut().zip(other.words.iter()) {
            *dst |= *src;
        }
    }

    pub fn intersection(&self, other: &Cpuset) -> Cpuset {
        let words = self
            .words
            .iter()
            .zip(other.words.iter())
            .map(|(a, b)| a & b)
            .collect();
        let mut result = Cpuset { words };
        result.trim();
        result
    }

    pub fn intersects(&self, other: &Cpuset) -> bool {
        self.words
            .iter()
            .zip(other.words.iter())
            .any(|(a, b)| a & b != 0)
    }

    /// True when every id in `self` is also in `other`.
    pub fn is_subset_of(&self, other: &Cpuset) -> bool {
        self.words.iter().enumerate().all(|(i, w)| {
            let o = other.words.get(i).copied().unwrap_or(0);
            w & !o == 0
        })
    }

    /// List form, e.g. `0-3,8,10-11`. The empty set renders as `""`.
    pub fn to_list_string(&self) -> String {
        let mut parts = Vec::new();
        let mut run: Option<(u32, u32)> = None;
        for id in self.iter() {
            run = match run {
                Some((start, end)) if id == end + 1 => Some((start, id)),
                Some((start, end)) => {
                    parts.push(render_run(start, end));
                    Some((id, id))
                }
                None => Some((id, id)),
            };
        }
        if let Some((start, end)) = run {
            parts.push(render_run(start, end));
        }
        parts.join(",")
    }

    /// Mask form: comma-separated 32-bit hex chunks, most significant first,
    /// e.g. `0xff` or `0x1,0x00000003`.
    pub fn to_mask_string(&self) -> String {
        let last = match self.last() {
            Some(last) => last,
            None => return "0x0".to_string(),
        };
        let nchunks = (last / 32 + 1) as usize;
        let mut chunks = Vec::with_capacity(nchunks);
        for c in (0..nchunks).rev() {
            let word = self.words.get(c / 2).copied().unwrap_or(0);
            let chunk = if c % 2 == 0 { word as u32 } else { (word >> 32) as u32 };
            if chunks.is_empty() {
                chunks.push(format!("0x{:x}", chunk));
            } else {
                chunks.push(format!("{:08x}", chunk));
            }
        }
        chunks.join(",")
    }

    /// Parses the list form. The empty string is the empty set.
    pub fn parse_list(input: &str) -> QvResult<Self> {
        let mut set = Cpuset::new();
        for part in input.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            match part.split_once('-') {
                Some((start, end)) => {
                    let start = parse_id(start)?;
                    let end = parse_id(end)?;
                    if start > end {
                        return Err(ReturnCode::InvalidArg);
                    }
                    for id in start..=end {
                        set.set(id);
                    }
                }
                None => set.set(parse_id(part)?),
            }
        }
        Ok(set)
    }

    /// Parses the mask form produced by [`to_mask_string`].
    pub fn parse_mask(input: &str) -> QvResult<Self> {
        let input = input.trim();
        let stripped = input.strip_prefix("0x").ok_or(ReturnCode::InvalidArg)?;
        let mut set = Cpuset::new();
        let chunks: Vec<&str> = stripped.split(',').collect();
        for (i, chunk) in chunks.iter().rev().enumerate() {
            let value =
                u32::from_str_radix(chunk, 16).map_err(|_| ReturnCode::InvalidArg)?;
            for bit in 0..32 {
                if value & (1 << bit) != 0 {
                    set.set(i as u32 * 32 + bit);
                }
            }
        }
        Ok(set)
    }

    fn trim(&mut self) {
        while self.words.last() == Some(&0) {
            self.words.pop();
        }
    }
}

fn render_run(start: u32, end: u32) -> String {
    if start == end {
        format!("{start}")
    } else {
        format!("{start}-{end}")
    }
}

fn parse_id(s: &str) -> QvResult<u32> {
    s.trim().parse().map_err(|_| ReturnCode::InvalidArg)
}

impl fmt::Display for Cpuset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_list_string())
    }
}

impl FromStr for Cpuset {
    type Err = ReturnCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().starts_with("0x") {
            Self::parse_mask(s)
        } else {
            Self::parse_list(s)
        }
    }
}

// Cpusets serialize as their list form so snapshots stay independent of the
// in-memory word layout.
impl Serialize for Cpuset {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_list_string())
    }
}

impl<'de> Deserialize<'de> for Cpuset {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Cpuset::parse_list(&s).map_err(|rc| D::Error::custom(rc.to_string()))
    }
}
