use std::collections::HashMap;

use crate::error::KiraError;

const MAGIC: &[u8; 4] = b"KBD1";
const MIN_BLOCK_LEN: usize = 16;
const MAX_BLOCK_LEN: usize = 4096;

const OP_COPY: u8 = 0;
const OP_INSERT: u8 = 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeltaOp {
    Copy { offset: u64, len: u64 },
    Insert(Vec<u8>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delta {
    source_len: u64,
    target_len: u64,
    ops: Vec<DeltaOp>,
}

impl Delta {
    pub fn ops(&self) -> &[DeltaOp] {
        &self.ops
    }

    pub fn source_len(&self) -> u64 {
        self.source_len
    }

    pub fn target_len(&self) -> u64 {
        self.target_len
    }

    pub fn literal_bytes(&self) -> u64 {
        self.ops
            .iter()
            .filter_map(|op| match op {
                DeltaOp::Insert(bytes) => Some(bytes.len() as u64),
                DeltaOp::Copy { .. } => None,
            })
            .sum()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.literal_bytes() as usize);
        out.extend_from_slice(MAGIC);
        write_varint(&mut out, self.source_len);
        write_varint(&mut out, self.target_len);
        write_varint(&mut out, self.ops.len() as u64);
        for op in &self.ops {
            match op {
                DeltaOp::Copy { offset, len } => {
                    out.push(OP_COPY);
                    write_varint(&mut out, *offset);
                    write_varint(&mut out, *len);
                }
                DeltaOp::Insert(bytes) => {
                    out.push(OP_INSERT);
                    write_varint(&mut out, bytes.len() as u64);
                    out.extend_from_slice(bytes);
                }
            }
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, KiraError> {
        let mut reader = Reader { bytes, pos: 0 };
        if reader.take(MAGIC.len())? != MAGIC {
            return Err(KiraError::Delta("bad delta header".to_string()));
        }
        let source_len = reader.varint()?;
        let target_len = reader.varint()?;
        let count = reader.varint()?;
        let mut ops = Vec::new();
        for _ in 0..count {
            match reader.byte()? {
                OP_COPY => {
                    let offset = reader.varint()?;
                    let len = reader.varint()?;
                    ops.push(DeltaOp::Copy { offset, len });
                }
                OP_INSERT => {
                    let len = usize::try_from(reader.varint()?)
                        .map_err(|_| KiraError::Delta("insert length overflow".to_string()))?;
                    ops.push(DeltaOp::Insert(reader.take(len)?.to_vec()));
                }
                other => {
                    return Err(KiraError::Delta(format!("unknown delta op {other}")));
                }
            }
        }
        if reader.pos != bytes.len() {
            return Err(KiraError::Delta("trailing bytes after delta".to_string()));
        }
        Ok(Self {
            source_len,
            target_len,
            ops,
        })
    }
}

pub fn diff(source: &[u8], target: &[u8]) -> Delta {
    let mut builder = OpsBuilder::default();

    let prefix = common_prefix(source, target);
    let suffix = common_suffix(&source[prefix..], &target[prefix..]);
    if prefix > 0 {
        builder.copy(0, prefix as u64);
    }

    let middle = &target[prefix..target.len() - suffix];
    match_blocks(source, middle, &mut builder);

    if suffix > 0 {
        builder.copy((source.len() - suffix) as u64, suffix as u64);
    }

    Delta {
        source_len: source.len() as u64,
        target_len: target.len() as u64,
        ops: builder.ops,
    }
}

pub fn apply(source: &[u8], delta: &Delta) -> Result<Vec<u8>, KiraError> {
    if delta.source_len != source.len() as u64 {
        return Err(KiraError::Delta(format!(
            "delta expects a {} byte basis, got {}",
            delta.source_len,
            source.len()
        )));
    }
    let capacity = usize::try_from(delta.target_len)
        .map_err(|_| KiraError::Delta("target length overflow".to_string()))?;
    let mut out = Vec::with_capacity(capacity);
    for op in &delta.ops {
        match op {
            DeltaOp::Copy { offset, len } => {
                let end = offset
                    .checked_add(*len)
                    .filter(|end| *end <= source.len() as u64)
                    .ok_or_else(|| KiraError::Delta("copy beyond end of basis".to_string()))?;
                out.extend_from_slice(&source[*offset as usize..end as usize]);
            }
            DeltaOp::Insert(bytes) => out.extend_from_slice(bytes),
        }
    }
    if out.len() as u64 != delta.target_len {
        return Err(KiraError::Delta(format!(
            "delta produced {} bytes, expected {}",
            out.len(),
            delta.target_len
        )));
    }
    Ok(out)
}

fn match_blocks(source: &[u8], middle: &[u8], builder: &mut OpsBuilder) {
    let block_len = block_len_for(source.len());
    if middle.len() < block_len || source.len() < block_len {
        builder.insert(middle);
        return;
    }

    let mut index: HashMap<u32, Vec<usize>> = HashMap::new();
    let mut offset = 0;
    while offset + block_len <= source.len() {
        let digest = RollingChecksum::new(&source[offset..offset + block_len]).digest();
        index.entry(digest).or_default().push(offset);
        offset += block_len;
    }

    let mut pos = 0;
    let mut literal_start = 0;
    let mut rolling = RollingChecksum::new(&middle[..block_len]);
    loop {
        let window = &middle[pos..pos + block_len];
        let found = index.get(&rolling.digest()).and_then(|candidates| {
            candidates
                .iter()
                .copied()
                .find(|candidate| &source[*candidate..*candidate + block_len] == window)
        });

        if let Some(basis_offset) = found {
            builder.insert(&middle[literal_start..pos]);
            let mut len = block_len;
            while basis_offset + len < source.len()
                && pos + len < middle.len()
                && source[basis_offset + len] == middle[pos + len]
            {
                len += 1;
            }
            builder.copy(basis_offset as u64, len as u64);
            pos += len;
            literal_start = pos;
            if pos + block_len > middle.len() {
                break;
            }
            rolling = RollingChecksum::new(&middle[pos..pos + block_len]);
            continue;
        }

        if pos + block_len >= middle.len() {
            break;
        }
        rolling.roll(middle[pos], middle[pos + block_len]);
        pos += 1;
    }
    builder.insert(&middle[literal_start..]);
}

fn block_len_for(source_len: usize) -> usize {
    let root = (source_len as f64).sqrt() as usize;
    root.clamp(MIN_BLOCK_LEN, MAX_BLOCK_LEN)
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

fn common_suffix(a: &[u8], b: &[u8]) -> usize {
    a.iter()
        .rev()
        .zip(b.iter().rev())
        .take_while(|(x, y)| x == y)
        .count()
}

#[derive(Default)]
struct OpsBuilder {
    ops: Vec<DeltaOp>,
}

impl OpsBuilder {
    fn copy(&mut self, offset: u64, len: u64) {
        if len == 0 {
            return;
        }
        if let Some(DeltaOp::Copy {
            offset: last_offset,
            len: last_len,
        }) = self.ops.last_mut()
        {
            if *last_offset + *last_len == offset {
                *last_len += len;
                return;
            }
        }
        self.ops.push(DeltaOp::Copy { offset, len });
    }

    fn insert(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        if let Some(DeltaOp::Insert(last)) = self.ops.last_mut() {
            last.extend_from_slice(bytes);
            return;
        }
        self.ops.push(DeltaOp::Insert(bytes.to_vec()));
    }
}

struct RollingChecksum {
    a: u32,
    b: u32,
    len: u32,
}

impl RollingChecksum {
    fn new(window: &[u8]) -> Self {
        let len = window.len() as u32;
        let mut a = 0u32;
        let mut b = 0u32;
        for (i, byte) in window.iter().enumerate() {
            a = a.wrapping_add(u32::from(*byte));
            b = b.wrapping_add((len - i as u32).wrapping_mul(u32::from(*byte)));
        }
        Self { a, b, len }
    }

    fn roll(&mut self, outgoing: u8, incoming: u8) {
        self.a = self
            .a
            .wrapping_sub(u32::from(outgoing))
            .wrapping_add(u32::from(incoming));
        self.b = self
            .b
            .wrapping_sub(self.len.wrapping_mul(u32::from(outgoing)))
            .wrapping_add(self.a);
    }

    fn digest(&self) -> u32 {
        (self.a & 0xffff) | (self.b << 16)
    }
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn byte(&mut self) -> Result<u8, KiraError> {
        let byte = *self
            .bytes
            .get(self.pos)
            .ok_or_else(|| KiraError::Delta("truncated delta".to_string()))?;
        self.pos += 1;
        Ok(byte)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], KiraError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| KiraError::Delta("truncated delta".to_string()))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn varint(&mut self) -> Result<u64, KiraError> {
        let mut value = 0u64;
        for shift in (0..64).step_by(7) {
            let byte = self.byte()?;
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(KiraError::Delta("varint overflow".to_string()))
    }
}
