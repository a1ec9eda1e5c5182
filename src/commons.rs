use std::fmt;

// system specs

/// Geometry and latency parameters shared by every component.
#[derive(Clone, Copy, Debug)]
pub struct SystemSpec {
    pub num_cores: usize,
    pub set_index_bits: u32,    // s, number of sets = 2^s
    pub assoc: usize,           // E, lines per set
    pub block_offset_bits: u32, // b, block size = 2^b bytes
    pub word_size: u32,         // bytes
    pub mem_lat: u64,           // cpu cycles
    pub bus_word_tf_lat: u64,   // cpu cycles per word on the bus
}

impl Default for SystemSpec {
    fn default() -> Self {
        SystemSpec {
            num_cores: 4,
            set_index_bits: 6,
            assoc: 2,
            block_offset_bits: 5,
            word_size: 4,       // bytes
            mem_lat: 100,       // cpu cycles
            bus_word_tf_lat: 2, // cpu cycles
        }
    }
}

impl SystemSpec {
    pub fn num_sets(&self) -> usize {
        1 << self.set_index_bits
    }
    pub fn block_size(&self) -> u32 {
        1 << self.block_offset_bits
    }
    pub fn words_per_block(&self) -> u64 {
        (self.block_size() / self.word_size) as u64
    }
    pub fn cache_size(&self) -> u64 {
        self.num_sets() as u64 * self.assoc as u64 * self.block_size() as u64
    }

    // timing
    pub fn t_cache_to_cache_transfer(&self) -> u64 {
        self.bus_word_tf_lat * self.words_per_block()
    }
    pub fn t_mem_fetch(&self) -> u64 {
        self.mem_lat
    }
    pub fn t_flush(&self) -> u64 {
        self.mem_lat
    }
    pub fn t_dirty_handoff(&self) -> u64 {
        // yanking a modified line away: transfer plus the memory write behind it
        2 * self.mem_lat
    }
}

// addresses

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Addr(pub u32);

impl Addr {
    /// returns the set index and tag of the address under given system specs
    pub fn pos(&self, specs: &SystemSpec) -> (usize, u32) {
        let shifted = self.0 as u64 >> specs.block_offset_bits;
        let index = shifted & ((1u64 << specs.set_index_bits) - 1);
        let tag = self.0 as u64 >> (specs.set_index_bits + specs.block_offset_bits);
        (index as usize, tag as u32)
    }
    /// rebuilds the block-aligned address of a (tag, set index) pair
    pub fn from_parts(tag: u32, index: usize, specs: &SystemSpec) -> Addr {
        let base = ((tag as u64) << (specs.set_index_bits + specs.block_offset_bits))
            | ((index as u64) << specs.block_offset_bits);
        Addr(base as u32)
    }
}

impl fmt::Debug for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

// memory references

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MemOp {
    Read,
    Write,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemRef {
    pub op: MemOp,
    pub addr: Addr,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_decomposition() {
        let specs = SystemSpec::default(); // s=6, b=5
        let addr = Addr(0xDEAD_BEEF);
        let (index, tag) = addr.pos(&specs);
        assert_eq!(index, ((0xDEAD_BEEFu32 >> 5) & 0x3F) as usize);
        assert_eq!(tag, 0xDEAD_BEEFu32 >> 11);
    }

    #[test]
    fn addr_roundtrip_block_aligned() {
        let specs = SystemSpec::default();
        let addr = Addr(0x0000_1F40);
        let (index, tag) = addr.pos(&specs);
        assert_eq!(Addr::from_parts(tag, index, &specs), Addr(0x1F40 & !0x1F));
    }

    #[test]
    fn addr_single_set() {
        // s = 0 collapses everything into one set
        let specs = SystemSpec {
            set_index_bits: 0,
            assoc: 1,
            ..SystemSpec::default()
        };
        let (i0, t0) = Addr(0x00).pos(&specs);
        let (i1, t1) = Addr(0x100).pos(&specs);
        assert_eq!(i0, 0);
        assert_eq!(i1, 0);
        assert_ne!(t0, t1);
    }

    #[test]
    fn derived_sizes() {
        let specs = SystemSpec::default();
        assert_eq!(specs.num_sets(), 64);
        assert_eq!(specs.block_size(), 32);
        assert_eq!(specs.words_per_block(), 8);
        assert_eq!(specs.cache_size(), 4096);
        assert_eq!(specs.t_cache_to_cache_transfer(), 16);
        assert_eq!(specs.t_mem_fetch(), 100);
        assert_eq!(specs.t_dirty_handoff(), 200);
    }
}
