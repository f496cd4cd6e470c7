//! Dataset registry and payload marshalling.
//!
//! Applications describe their telegram payloads as datasets: flat lists of
//! typed elements, optionally nesting other datasets. The registry maps
//! comIds to dataset schemas; the marshaller serialises naturally aligned
//! host images into packed big-endian wire bytes and back.
//!
//! Variable sized arrays (`count == 0`) take their element count from the
//! most recently marshalled integer scalar on the host side and carry an
//! explicit `u16` count prefix on the wire.

use crate::error::{Error, Result};

/// Element counts above this value are taken literally; `VAR_SIZE` marks a
/// variable sized array.
pub const VAR_SIZE: u32 = 0;

/// Type ids above this value reference another dataset.
pub const TYPE_MAX_PRIMITIVE: u32 = 30;

/// Hard cap on dataset nesting.
pub const MAX_DEPTH: u32 = 5;

/// Primitive element types.
///
/// Discriminants are fixed by the protocol's dataset configuration format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DataType {
    /// Unsigned 8 bit, only zero/non-zero relevant.
    Boolean8 = 1,
    /// 8 bit character (also UTF-8 octets).
    Char8 = 2,
    /// UTF-16 code unit.
    Utf16 = 3,
    /// Signed 8 bit integer.
    Int8 = 4,
    /// Signed 16 bit integer.
    Int16 = 5,
    /// Signed 32 bit integer.
    Int32 = 6,
    /// Signed 64 bit integer.
    Int64 = 7,
    /// Unsigned 8 bit integer.
    UInt8 = 8,
    /// Unsigned 16 bit integer.
    UInt16 = 9,
    /// Unsigned 32 bit integer.
    UInt32 = 10,
    /// Unsigned 64 bit integer.
    UInt64 = 11,
    /// IEEE 754 single precision.
    Real32 = 12,
    /// IEEE 754 double precision.
    Real64 = 13,
    /// 32 bit UNIX time.
    TimeDate32 = 14,
    /// 32 bit UNIX time plus 16 bit ticks.
    TimeDate48 = 15,
    /// 32 bit UNIX time plus 32 bit microseconds.
    TimeDate64 = 16,
}

impl DataType {
    /// Decode a type id; `None` for reserved or dataset reference ids.
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            1 => Self::Boolean8,
            2 => Self::Char8,
            3 => Self::Utf16,
            4 => Self::Int8,
            5 => Self::Int16,
            6 => Self::Int32,
            7 => Self::Int64,
            8 => Self::UInt8,
            9 => Self::UInt16,
            10 => Self::UInt32,
            11 => Self::UInt64,
            12 => Self::Real32,
            13 => Self::Real64,
            14 => Self::TimeDate32,
            15 => Self::TimeDate48,
            16 => Self::TimeDate64,
            _ => return None,
        })
    }

    /// Natural alignment of the host representation.
    pub fn host_align(self) -> usize {
        match self {
            Self::Boolean8 | Self::Char8 | Self::Int8 | Self::UInt8 => 1,
            Self::Utf16 | Self::Int16 | Self::UInt16 => 2,
            Self::Int32 | Self::UInt32 | Self::Real32 | Self::TimeDate32 => 4,
            Self::Int64 | Self::UInt64 | Self::Real64 => 8,
            // struct { u32 seconds; u16 ticks; } / struct { u32; u32; }
            Self::TimeDate48 | Self::TimeDate64 => 4,
        }
    }

    /// Size of one element in the host image, padding included.
    pub fn host_size(self) -> usize {
        match self {
            Self::Boolean8 | Self::Char8 | Self::Int8 | Self::UInt8 => 1,
            Self::Utf16 | Self::Int16 | Self::UInt16 => 2,
            Self::Int32 | Self::UInt32 | Self::Real32 | Self::TimeDate32 => 4,
            Self::Int64 | Self::UInt64 | Self::Real64 => 8,
            Self::TimeDate48 => 8,
            Self::TimeDate64 => 8,
        }
    }

    /// Size of one element on the wire (packed).
    pub fn wire_size(self) -> usize {
        match self {
            Self::Boolean8 | Self::Char8 | Self::Int8 | Self::UInt8 => 1,
            Self::Utf16 | Self::Int16 | Self::UInt16 => 2,
            Self::Int32 | Self::UInt32 | Self::Real32 | Self::TimeDate32 => 4,
            Self::Int64 | Self::UInt64 | Self::Real64 | Self::TimeDate64 => 8,
            Self::TimeDate48 => 6,
        }
    }
}

/// One element of a dataset: a primitive type or a nested dataset id, with
/// a fixed count or [`VAR_SIZE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatasetElement {
    /// Primitive type id (1..=30) or referenced dataset id (> 30).
    pub type_id: u32,
    /// Element count, or [`VAR_SIZE`] for a variable sized array.
    pub count: u32,
}

/// A dataset schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    /// Dataset identifier, conventionally > 1000.
    pub id: u32,
    /// Ordered element list.
    pub elements: Vec<DatasetElement>,
}

/// Process wide schema registry, initialised once with the application's
/// telegram configuration.
#[derive(Debug, Default, Clone)]
pub struct Registry {
    /// (comId, datasetId), sorted by comId.
    com_map: Vec<(u32, u32)>,
    /// Datasets sorted by id.
    datasets: Vec<Dataset>,
}

impl Registry {
    /// Build a registry; both tables are sorted once so lookups are
    /// O(log n).
    pub fn new(mut com_map: Vec<(u32, u32)>, mut datasets: Vec<Dataset>) -> Self {
        com_map.sort_unstable_by_key(|&(com_id, _)| com_id);
        datasets.sort_unstable_by_key(|ds| ds.id);
        Self { com_map, datasets }
    }

    /// Look up a dataset by its id.
    pub fn dataset(&self, id: u32) -> Option<&Dataset> {
        self.datasets
            .binary_search_by_key(&id, |ds| ds.id)
            .ok()
            .map(|i| &self.datasets[i])
    }

    /// Look up the dataset registered for a comId.
    pub fn dataset_for_com_id(&self, com_id: u32) -> Option<&Dataset> {
        let idx = self
            .com_map
            .binary_search_by_key(&com_id, |&(c, _)| c)
            .ok()?;
        self.dataset(self.com_map[idx].1)
    }

    /// Whether any schema is registered at all.
    pub fn is_empty(&self) -> bool {
        self.com_map.is_empty()
    }

    /// Serialise a host image into wire bytes.
    ///
    /// Returns the number of wire bytes written.
    pub fn marshall(&self, com_id: u32, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        let dataset = self
            .dataset_for_com_id(com_id)
            .ok_or(Error::ComId(com_id))?;
        let mut ctx = Ctx {
            registry: self,
            src_pos: 0,
            dst_pos: 0,
            var_count: 0,
            level: 0,
        };
        ctx.marshall_ds(dataset, src, dst)?;
        Ok(ctx.dst_pos)
    }

    /// Deserialise wire bytes into a host image.
    ///
    /// Returns the number of host bytes written.
    pub fn unmarshall(&self, com_id: u32, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        let dataset = self
            .dataset_for_com_id(com_id)
            .ok_or(Error::ComId(com_id))?;
        let mut ctx = Ctx {
            registry: self,
            src_pos: 0,
            dst_pos: 0,
            var_count: 0,
            level: 0,
        };
        ctx.unmarshall_ds(dataset, src, dst)?;
        Ok(ctx.dst_pos)
    }
}

const fn align_up(pos: usize, alignment: usize) -> usize {
    (pos + alignment - 1) & !(alignment - 1)
}

struct Ctx<'a> {
    registry: &'a Registry,
    src_pos: usize,
    dst_pos: usize,
    /// Most recent integer scalar value, the host side count for a
    /// following variable sized array.
    var_count: u32,
    level: u32,
}

impl Ctx<'_> {
    fn marshall_ds(&mut self, dataset: &Dataset, src: &[u8], dst: &mut [u8]) -> Result<()> {
        self.level += 1;
        if self.level > MAX_DEPTH {
            return Err(Error::State("dataset nesting too deep"));
        }

        for element in &dataset.elements {
            let count = if element.count == VAR_SIZE {
                let n = self.var_count;
                if n > u16::MAX as u32 {
                    return Err(Error::Param("variable array count exceeds u16"));
                }
                self.put_wire(dst, &(n as u16).to_be_bytes())?;
                n
            } else {
                element.count
            };

            if element.type_id > TYPE_MAX_PRIMITIVE {
                let nested = self
                    .registry
                    .dataset(element.type_id)
                    .ok_or(Error::ComId(element.type_id))?;
                for _ in 0..count {
                    self.marshall_ds(nested, src, dst)?;
                }
            } else {
                let ty = DataType::from_u32(element.type_id)
                    .ok_or(Error::Param("reserved dataset element type"))?;
                for _ in 0..count {
                    self.marshall_item(ty, src, dst)?;
                }
            }
        }

        self.level -= 1;
        Ok(())
    }

    fn unmarshall_ds(&mut self, dataset: &Dataset, src: &[u8], dst: &mut [u8]) -> Result<()> {
        self.level += 1;
        if self.level > MAX_DEPTH {
            return Err(Error::State("dataset nesting too deep"));
        }

        for element in &dataset.elements {
            let count = if element.count == VAR_SIZE {
                let mut buf = [0u8; 2];
                self.take_wire(src, &mut buf)?;
                u16::from_be_bytes(buf) as u32
            } else {
                element.count
            };

            if element.type_id > TYPE_MAX_PRIMITIVE {
                let nested = self
                    .registry
                    .dataset(element.type_id)
                    .ok_or(Error::ComId(element.type_id))?;
                for _ in 0..count {
                    self.unmarshall_ds(nested, src, dst)?;
                }
            } else {
                let ty = DataType::from_u32(element.type_id)
                    .ok_or(Error::Param("reserved dataset element type"))?;
                for _ in 0..count {
                    self.unmarshall_item(ty, src, dst)?;
                }
            }
        }

        self.level -= 1;
        Ok(())
    }

    /// Marshall one item: read at the aligned host cursor, write packed
    /// big-endian bytes.
    fn marshall_item(&mut self, ty: DataType, src: &[u8], dst: &mut [u8]) -> Result<()> {
        self.src_pos = align_up(self.src_pos, ty.host_align());
        let size = ty.host_size();
        let item = src
            .get(self.src_pos..self.src_pos + size)
            .ok_or(Error::Param("source image exhausted"))?;

        match ty {
            DataType::Boolean8 | DataType::Char8 | DataType::Int8 | DataType::UInt8 => {
                self.var_count = item[0] as u32;
                self.put_wire(dst, &[item[0]])?;
            }
            DataType::Utf16 | DataType::Int16 | DataType::UInt16 => {
                let v = u16::from_ne_bytes(item.try_into().unwrap());
                self.var_count = v as u32;
                self.put_wire(dst, &v.to_be_bytes())?;
            }
            DataType::Int32 | DataType::UInt32 | DataType::Real32 | DataType::TimeDate32 => {
                let v = u32::from_ne_bytes(item.try_into().unwrap());
                self.var_count = v;
                self.put_wire(dst, &v.to_be_bytes())?;
            }
            DataType::Int64 | DataType::UInt64 | DataType::Real64 => {
                let v = u64::from_ne_bytes(item.try_into().unwrap());
                self.var_count = v as u32;
                self.put_wire(dst, &v.to_be_bytes())?;
            }
            DataType::TimeDate48 => {
                let seconds = u32::from_ne_bytes(item[..4].try_into().unwrap());
                let ticks = u16::from_ne_bytes(item[4..6].try_into().unwrap());
                self.put_wire(dst, &seconds.to_be_bytes())?;
                self.put_wire(dst, &ticks.to_be_bytes())?;
            }
            DataType::TimeDate64 => {
                let seconds = u32::from_ne_bytes(item[..4].try_into().unwrap());
                let micros = u32::from_ne_bytes(item[4..8].try_into().unwrap());
                self.put_wire(dst, &seconds.to_be_bytes())?;
                self.put_wire(dst, &micros.to_be_bytes())?;
            }
        }

        self.src_pos += size;
        Ok(())
    }

    /// Unmarshall one item: read packed big-endian bytes, write at the
    /// aligned host cursor.
    fn unmarshall_item(&mut self, ty: DataType, src: &[u8], dst: &mut [u8]) -> Result<()> {
        let host_pos = align_up(self.dst_pos, ty.host_align());
        let size = ty.host_size();
        if host_pos + size > dst.len() {
            return Err(Error::Mem("destination image too small"));
        }
        // Zero any alignment gap so round trips are byte stable.
        dst[self.dst_pos..host_pos].fill(0);
        self.dst_pos = host_pos;

        match ty {
            DataType::Boolean8 | DataType::Char8 | DataType::Int8 | DataType::UInt8 => {
                let mut b = [0u8; 1];
                self.take_wire(src, &mut b)?;
                dst[self.dst_pos] = b[0];
            }
            DataType::Utf16 | DataType::Int16 | DataType::UInt16 => {
                let mut b = [0u8; 2];
                self.take_wire(src, &mut b)?;
                let v = u16::from_be_bytes(b);
                dst[self.dst_pos..self.dst_pos + 2].copy_from_slice(&v.to_ne_bytes());
            }
            DataType::Int32 | DataType::UInt32 | DataType::Real32 | DataType::TimeDate32 => {
                let mut b = [0u8; 4];
                self.take_wire(src, &mut b)?;
                let v = u32::from_be_bytes(b);
                dst[self.dst_pos..self.dst_pos + 4].copy_from_slice(&v.to_ne_bytes());
            }
            DataType::Int64 | DataType::UInt64 | DataType::Real64 => {
                let mut b = [0u8; 8];
                self.take_wire(src, &mut b)?;
                let v = u64::from_be_bytes(b);
                dst[self.dst_pos..self.dst_pos + 8].copy_from_slice(&v.to_ne_bytes());
            }
            DataType::TimeDate48 => {
                let mut secs = [0u8; 4];
                let mut ticks = [0u8; 2];
                self.take_wire(src, &mut secs)?;
                self.take_wire(src, &mut ticks)?;
                let s = u32::from_be_bytes(secs);
                let t = u16::from_be_bytes(ticks);
                dst[self.dst_pos..self.dst_pos + 4].copy_from_slice(&s.to_ne_bytes());
                dst[self.dst_pos + 4..self.dst_pos + 6].copy_from_slice(&t.to_ne_bytes());
                dst[self.dst_pos + 6..self.dst_pos + 8].fill(0);
            }
            DataType::TimeDate64 => {
                let mut secs = [0u8; 4];
                let mut micros = [0u8; 4];
                self.take_wire(src, &mut secs)?;
                self.take_wire(src, &mut micros)?;
                let s = u32::from_be_bytes(secs);
                let u = u32::from_be_bytes(micros);
                dst[self.dst_pos..self.dst_pos + 4].copy_from_slice(&s.to_ne_bytes());
                dst[self.dst_pos + 4..self.dst_pos + 8].copy_from_slice(&u.to_ne_bytes());
            }
        }

        self.dst_pos += size;
        Ok(())
    }

    fn put_wire(&mut self, dst: &mut [u8], bytes: &[u8]) -> Result<()> {
        let end = self.dst_pos + bytes.len();
        if end > dst.len() {
            return Err(Error::Mem("wire buffer too small"));
        }
        dst[self.dst_pos..end].copy_from_slice(bytes);
        self.dst_pos = end;
        Ok(())
    }

    fn take_wire(&mut self, src: &[u8], bytes: &mut [u8]) -> Result<()> {
        let end = self.src_pos + bytes.len();
        if end > src.len() {
            return Err(Error::Wire("wire data truncated"));
        }
        bytes.copy_from_slice(&src[self.src_pos..end]);
        self.src_pos = end;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Registry {
        Registry::new(
            vec![(1001, 2001), (1002, 2002), (1003, 2003)],
            vec![
                // u8, u32 (alignment gap on the host side), u16
                Dataset {
                    id: 2001,
                    elements: vec![
                        DatasetElement {
                            type_id: DataType::UInt8 as u32,
                            count: 1,
                        },
                        DatasetElement {
                            type_id: DataType::UInt32 as u32,
                            count: 1,
                        },
                        DatasetElement {
                            type_id: DataType::UInt16 as u32,
                            count: 1,
                        },
                    ],
                },
                // u8 count followed by a variable u16 array
                Dataset {
                    id: 2002,
                    elements: vec![
                        DatasetElement {
                            type_id: DataType::UInt8 as u32,
                            count: 1,
                        },
                        DatasetElement {
                            type_id: DataType::UInt16 as u32,
                            count: VAR_SIZE,
                        },
                    ],
                },
                // two nested 2001 records
                Dataset {
                    id: 2003,
                    elements: vec![DatasetElement {
                        type_id: 2001,
                        count: 2,
                    }],
                },
            ],
        )
    }

    #[test]
    fn test_lookup() {
        let reg = registry();
        assert_eq!(reg.dataset_for_com_id(1001).unwrap().id, 2001);
        assert_eq!(reg.dataset(2003).unwrap().elements.len(), 1);
        assert!(reg.dataset_for_com_id(9999).is_none());
    }

    #[test]
    fn test_marshall_packs_and_aligns() {
        let reg = registry();
        // host image: u8 @0, pad 1..4, u32 @4, u16 @8
        let mut host = [0u8; 10];
        host[0] = 0xAB;
        host[4..8].copy_from_slice(&0x11223344u32.to_ne_bytes());
        host[8..10].copy_from_slice(&0x5566u16.to_ne_bytes());

        let mut wire = [0u8; 16];
        let n = reg.marshall(1001, &host, &mut wire).unwrap();
        assert_eq!(n, 7); // packed: 1 + 4 + 2
        assert_eq!(wire[0], 0xAB);
        assert_eq!(&wire[1..5], &0x11223344u32.to_be_bytes());
        assert_eq!(&wire[5..7], &0x5566u16.to_be_bytes());
    }

    #[test]
    fn test_unmarshall_restores_host_image() {
        let reg = registry();
        let mut host = [0u8; 10];
        host[0] = 0x7F;
        host[4..8].copy_from_slice(&0xDEADBEEFu32.to_ne_bytes());
        host[8..10].copy_from_slice(&0x0102u16.to_ne_bytes());

        let mut wire = [0u8; 16];
        let n = reg.marshall(1001, &host, &mut wire).unwrap();

        let mut back = [0u8; 10];
        let m = reg.unmarshall(1001, &wire[..n], &mut back).unwrap();
        assert_eq!(m, 10);
        assert_eq!(host, back);
    }

    #[test]
    fn test_variable_array_wire_prefix() {
        let reg = registry();
        // host: count byte = 3, pad to 2, then 3 u16 items
        let mut host = [0u8; 8];
        host[0] = 3;
        for (i, v) in [0x0a0bu16, 0x0c0d, 0x0e0f].iter().enumerate() {
            host[2 + 2 * i..4 + 2 * i].copy_from_slice(&v.to_ne_bytes());
        }

        let mut wire = [0u8; 16];
        let n = reg.marshall(1002, &host, &mut wire).unwrap();
        // count byte + u16 prefix + 3 packed u16
        assert_eq!(n, 1 + 2 + 6);
        assert_eq!(&wire[1..3], &3u16.to_be_bytes());

        let mut back = [0u8; 8];
        let m = reg.unmarshall(1002, &wire[..n], &mut back).unwrap();
        assert_eq!(m, 8);
        assert_eq!(host, back);
    }

    #[test]
    fn test_nested_dataset() {
        let reg = registry();
        // The cursor keeps running across nested records, so the second
        // record starts at offset 10 (u8), u32 re-aligned to 12, u16 at 16.
        let mut host = [0u8; 18];
        host[0] = 1;
        host[4..8].copy_from_slice(&0x1000u32.to_ne_bytes());
        host[8..10].copy_from_slice(&0x20u16.to_ne_bytes());
        host[10] = 2;
        host[12..16].copy_from_slice(&0x1001u32.to_ne_bytes());
        host[16..18].copy_from_slice(&0x21u16.to_ne_bytes());

        let mut wire = [0u8; 32];
        let n = reg.marshall(1003, &host, &mut wire).unwrap();
        assert_eq!(n, 14); // two packed 7 byte records

        let mut back = [0u8; 18];
        let m = reg.unmarshall(1003, &wire[..n], &mut back).unwrap();
        assert_eq!(m, 18);
        assert_eq!(host, back);
    }

    #[test]
    fn test_depth_cap() {
        // 3001 nests itself; must fail with a state error, not recurse
        // forever.
        let reg = Registry::new(
            vec![(1, 3001)],
            vec![Dataset {
                id: 3001,
                elements: vec![DatasetElement {
                    type_id: 3001,
                    count: 1,
                }],
            }],
        );
        let host = [0u8; 4];
        let mut wire = [0u8; 64];
        assert!(matches!(
            reg.marshall(1, &host, &mut wire),
            Err(Error::State(_))
        ));
    }

    #[test]
    fn test_wire_overflow_is_mem_err() {
        let reg = registry();
        let host = [0u8; 10];
        let mut wire = [0u8; 3];
        assert!(matches!(
            reg.marshall(1001, &host, &mut wire),
            Err(Error::Mem(_))
        ));
    }

    #[test]
    fn test_unknown_com_id() {
        let reg = registry();
        let mut wire = [0u8; 8];
        assert!(matches!(
            reg.marshall(4711, &[0u8; 4], &mut wire),
            Err(Error::ComId(4711))
        ));
    }

    #[test]
    fn test_timedate48_wire_is_six_bytes() {
        let reg = Registry::new(
            vec![(1, 3001)],
            vec![Dataset {
                id: 3001,
                elements: vec![DatasetElement {
                    type_id: DataType::TimeDate48 as u32,
                    count: 1,
                }],
            }],
        );
        let mut host = [0u8; 8];
        host[..4].copy_from_slice(&0x5F00_0000u32.to_ne_bytes());
        host[4..6].copy_from_slice(&0x1234u16.to_ne_bytes());

        let mut wire = [0u8; 8];
        let n = reg.marshall(1, &host, &mut wire).unwrap();
        assert_eq!(n, 6);

        let mut back = [0u8; 8];
        reg.unmarshall(1, &wire[..n], &mut back).unwrap();
        assert_eq!(&back[..6], &host[..6]);
    }
}
