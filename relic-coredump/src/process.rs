//! Process table reconstruction.
//!
//! Processes live in heap blocks referenced by a chain of `Process Array`
//! blocks. Each process structure is a fixed-size blob terminated by
//! `BEEFCAFE`; the terminator offset selects one of a closed set of known
//! field layouts. When a dump carries an unknown variant, a statistical pass
//! over the observed structures recovers the important fields instead.

use std::collections::BTreeMap;
use std::collections::HashMap;

use thiserror::Error;

use relic_common::{find, magic};

use crate::block::MemoryBlocks;
use crate::region::{CoreDump, CoreDumpError};

/// Column header matching [`Process::render_line`].
pub const PROCESS_LISTING_HEADER: &str =
    " PID QTy       PC Runtime (ms)    Invoked   uSecs    Stacks TTY StackBlk Process";

/// The terminator is never searched before this offset; `BEEFCAFE` can occur
/// early in the structure as payload.
const PROCESS_END_SEARCH_START: usize = 690;

/// Fraction of unsupported structures that triggers heuristic discovery.
const HEURISTICS_THRESHOLD: f64 = 0.95;

/// Per-column value histograms, keyed by structure length, then by 32-bit
/// column index.
pub type ProcessStructureStats = BTreeMap<usize, BTreeMap<usize, BTreeMap<u32, u32>>>;

/// Byte offsets of the logical process fields within one structure variant.
///
/// `None` marks a field the variant does not expose.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProcessLayout {
    /// Pointer to the process name string.
    pub address_process_name: Option<usize>,
    /// Program counter.
    pub pc: Option<usize>,
    /// Scheduler priority.
    pub q: Option<usize>,
    /// Process type.
    pub ty: Option<usize>,
    /// Accumulated runtime in milliseconds.
    pub runtime: Option<usize>,
    /// Invocation count.
    pub invoked: Option<usize>,
    /// First stack figure.
    pub stack1: Option<usize>,
    /// Second stack figure (stack size).
    pub stack2: Option<usize>,
    /// Pointer to the stack block.
    pub address_stack_block: Option<usize>,
    /// Pointer to the TTY structure.
    pub address_tty: Option<usize>,
}

/// The known structure layout variants, keyed by terminator offset.
pub fn known_layout(length: usize) -> Option<ProcessLayout> {
    let layout = match length {
        692 => ProcessLayout {
            address_process_name: Some(0xD0),
            pc: Some(0x6C),
            q: Some(0xD4),
            ty: Some(0x64),
            runtime: Some(0xB8),
            invoked: Some(0xC8),
            stack1: Some(0xEC),
            stack2: Some(0xF0),
            address_stack_block: Some(0x00),
            address_tty: Some(0xF8),
        },
        696 => ProcessLayout {
            address_process_name: Some(0xE8),
            pc: Some(0x90),
            q: Some(0xEC),
            ty: Some(0x88),
            runtime: Some(0xD8),
            invoked: Some(0xE0),
            stack1: Some(0x100),
            stack2: Some(0x104),
            address_stack_block: Some(0x00),
            address_tty: Some(0xC4),
        },
        712 => ProcessLayout {
            address_process_name: Some(0xE8),
            pc: Some(0x90),
            q: Some(0xEC),
            ty: Some(0x88),
            runtime: Some(0xD0),
            invoked: Some(0xE0),
            stack1: Some(0x100),
            stack2: Some(0x104),
            address_stack_block: Some(0x00),
            address_tty: Some(0xC4),
        },
        732 => ProcessLayout {
            address_process_name: Some(0xF8),
            pc: Some(0x90),
            q: Some(0xFC),
            ty: Some(0x88),
            runtime: Some(0xE0),
            invoked: Some(0xF0),
            stack1: Some(0x114),
            stack2: Some(0x118),
            address_stack_block: Some(0x00),
            address_tty: Some(0xCC),
        },
        744 => ProcessLayout {
            address_process_name: Some(0xD8),
            pc: Some(0x70),
            q: Some(0xDC),
            ty: Some(0x68),
            runtime: Some(0xC0),
            invoked: Some(0xD0),
            stack1: Some(0xF8),
            stack2: Some(0xFC),
            address_stack_block: Some(0x00),
            address_tty: Some(0x100),
        },
        _ => return None,
    };
    Some(layout)
}

/// Renders a priority value the way the IOS process listing does.
pub fn priority_str(value: u32) -> String {
    match value {
        2 => "C".to_owned(),
        3 => "H".to_owned(),
        4 => "M".to_owned(),
        5 => "L".to_owned(),
        other => other.to_string(),
    }
}

/// Renders a process type value the way the IOS process listing does.
pub fn type_str(value: u32) -> String {
    match value {
        0 => "*".to_owned(),
        1 => "E".to_owned(),
        2 => "S".to_owned(),
        3 => "rd".to_owned(),
        4 => "we".to_owned(),
        5 => "sa".to_owned(),
        6 => "si".to_owned(),
        7 => "sp".to_owned(),
        8 => "st".to_owned(),
        9 => "hg".to_owned(),
        10 => "xx".to_owned(),
        other => other.to_string(),
    }
}

/// An error extracting a single process structure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum ProcessError {
    /// No `BEEFCAFE` terminator in the searched range.
    #[error("parsing process structure, BEEFCAFE not found")]
    EndMagicNotFound,
    /// The terminator offset is not a known structure variant.
    #[error("unexpected process structure, length = {0}")]
    UnsupportedLength(usize),
}

/// A reconstructed process descriptor.
#[derive(Clone, Debug, Default)]
pub struct Process {
    /// Position in the process table (1-based).
    pub pid: usize,
    /// Structure length (the terminator offset), when found.
    pub structure_len: Option<usize>,
    /// Pointer to the process name string.
    pub address_process_name: Option<u32>,
    /// Program counter.
    pub pc: Option<u32>,
    /// Scheduler priority.
    pub q: Option<u32>,
    /// Process type.
    pub ty: Option<u32>,
    /// Accumulated runtime in milliseconds.
    pub runtime: Option<u32>,
    /// Invocation count.
    pub invoked: Option<u32>,
    /// First stack figure.
    pub stack1: Option<u32>,
    /// Second stack figure (stack size).
    pub stack2: Option<u32>,
    /// Pointer to the stack block.
    pub address_stack_block: Option<u32>,
    /// Pointer to the TTY structure.
    pub address_tty: Option<u32>,
    /// Priority rendered for listings, `?` when unknown.
    pub q_str: String,
    /// Type rendered for listings, `?` when unknown.
    pub ty_str: String,
    /// Bytes of untouched (`0xFFFFFFFF`) stack below the low-water mark.
    pub low_water_mark: Option<u32>,
    /// TTY number dereferenced from the TTY structure.
    pub tty: Option<u32>,
    /// The process name read from the core dump.
    pub name: Option<String>,
    /// Why extraction failed, if it did.
    pub error: Option<ProcessError>,
}

impl Process {
    /// Extracts a process from a structure blob.
    ///
    /// `heuristic` supplies a discovered layout for one structure length;
    /// lengths not covered by it fall back to the known variants. Column
    /// statistics are accumulated into `stats` for every structure whose
    /// terminator was found.
    pub fn parse(
        pid: usize,
        data: &[u8],
        core: &CoreDump<'_>,
        stats: &mut ProcessStructureStats,
        heuristic: Option<(usize, ProcessLayout)>,
    ) -> Self {
        let mut process = Process {
            pid,
            q_str: "?".to_owned(),
            ty_str: "?".to_owned(),
            ..Process::default()
        };
        let length = match find(data, magic::PROCESS_END, PROCESS_END_SEARCH_START) {
            Some(length) => length,
            None => {
                process.error = Some(ProcessError::EndMagicNotFound);
                return process;
            }
        };
        process.structure_len = Some(length);

        let layout = match heuristic {
            Some((size, layout)) if size == length => Some(layout),
            _ => known_layout(length),
        };
        match layout {
            Some(layout) => process.extract_fields(data, &layout, core),
            None => process.error = Some(ProcessError::UnsupportedLength(length)),
        }

        let columns = stats.entry(length).or_default();
        for (index, word) in data.chunks_exact(4).enumerate() {
            let value = u32::from_be_bytes([word[0], word[1], word[2], word[3]]);
            *columns.entry(index).or_default().entry(value).or_insert(0) += 1;
        }
        process
    }

    fn extract_fields(&mut self, data: &[u8], layout: &ProcessLayout, core: &CoreDump<'_>) {
        let field = |offset: Option<usize>| -> Option<u32> {
            let offset = offset?;
            let bytes = data.get(offset..offset + 4)?;
            Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        };
        self.address_process_name = field(layout.address_process_name);
        self.pc = field(layout.pc);
        self.q = field(layout.q);
        self.ty = field(layout.ty);
        self.runtime = field(layout.runtime);
        self.invoked = field(layout.invoked);
        self.stack1 = field(layout.stack1);
        self.stack2 = field(layout.stack2);
        self.address_stack_block = field(layout.address_stack_block);
        self.address_tty = field(layout.address_tty);

        if let Some(q) = self.q {
            self.q_str = priority_str(q);
        }
        if let Some(ty) = self.ty {
            self.ty_str = type_str(ty);
        }

        if let (Some(stack_block), Some(stack2)) = (self.address_stack_block, self.stack2) {
            let mut address = stack_block;
            while core.get_u32(address) == Some(0xFFFF_FFFF)
                && address.wrapping_sub(stack_block) <= stack2
            {
                address = address.wrapping_add(4);
            }
            self.low_water_mark = Some(address.wrapping_sub(stack_block));
        }

        self.tty = match self.address_tty {
            None => None,
            Some(0) => Some(0),
            Some(address) => core.get_u32(address.wrapping_add(4)),
        };
        self.name = self.address_process_name.and_then(|a| core.get_string(a));
    }

    /// Renders the process as one listing line.
    pub fn render_line(&self) -> String {
        let mut line = format!("{:4} {}{:<2} ", self.pid, self.q_str, self.ty_str);
        match self.pc {
            Some(pc) => line.push_str(&format!("{pc:08X} ")),
            None => line.push_str("???????? "),
        }
        match self.runtime {
            Some(runtime) => line.push_str(&format!("    {runtime:8} ")),
            None => line.push_str("       ? "),
        }
        match self.invoked {
            Some(invoked) => line.push_str(&format!("  {invoked:8} ")),
            None => line.push_str("       ? "),
        }
        match (self.runtime, self.invoked) {
            (Some(runtime), Some(invoked)) if invoked != 0 => {
                line.push_str(&format!("{:7}", runtime as u64 * 1000 / invoked as u64));
            }
            _ => line.push_str("      ?"),
        }
        match self.low_water_mark {
            Some(mark) => line.push_str(&format!("{mark:5}/")),
            None => line.push_str("    ?/"),
        }
        match self.stack2 {
            Some(stack2) => line.push_str(&format!("{stack2:<5} ")),
            None => line.push_str("?     "),
        }
        match self.tty {
            Some(tty) => line.push_str(&format!("{tty:>2} ")),
            None => line.push_str(" ? "),
        }
        match self.address_stack_block {
            Some(block) => line.push_str(&format!("{block:08X} ")),
            None => line.push_str("       ? "),
        }
        line.push_str(self.name.as_deref().unwrap_or("Not found"));
        line
    }
}

/// One slot of the reconstructed process table.
#[derive(Clone, Debug)]
pub struct ProcessSlot {
    /// Position in the process table (1-based).
    pub pid: usize,
    /// Address of the process structure in the router's address space.
    pub address: u32,
    /// The extracted process; `None` when no heap block covers the address.
    pub process: Option<Process>,
}

/// An error aborting the core dump analysis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum AnalysisError {
    /// The region table could not be recovered.
    #[error(transparent)]
    Core(#[from] CoreDumpError),
    /// The dump has no usable heap region.
    #[error("heap region not found")]
    HeapRegionMissing,
}

/// Summary of one 32-bit column across all structures of one length.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ColumnStats {
    /// Number of distinct values observed.
    pub distinct: usize,
    /// Smallest value.
    pub min: u32,
    /// Smallest nonzero value, or `min` when the column is all zero.
    pub min_nonzero: u32,
    /// Largest value.
    pub max: u32,
    /// How many structures held zero in this column.
    pub zero_count: u32,
    /// Names of the regions containing `min_nonzero` or `max`.
    pub regions: Vec<&'static str>,
}

/// Summarizes the per-column histograms of one structure length.
pub fn column_stats(
    columns: &BTreeMap<usize, BTreeMap<u32, u32>>,
    core: &CoreDump<'_>,
) -> BTreeMap<usize, ColumnStats> {
    let mut summary = BTreeMap::new();
    for (&column, histogram) in columns {
        let min = histogram.keys().next().copied().unwrap_or(0);
        let max = histogram.keys().next_back().copied().unwrap_or(0);
        let min_nonzero = histogram
            .keys()
            .find(|&&value| value != 0)
            .copied()
            .unwrap_or(min);
        let mut regions = Vec::new();
        for region in &core.regions {
            if let Some(len) = region.len {
                let contains = |value: u32| {
                    value >= region.start && value <= region.start.wrapping_add(len).wrapping_sub(1)
                };
                if (contains(min_nonzero) || contains(max)) && !regions.contains(&region.name) {
                    regions.push(region.name);
                }
            }
        }
        regions.sort_unstable();
        summary.insert(
            column,
            ColumnStats {
                distinct: histogram.len(),
                min,
                min_nonzero,
                max,
                zero_count: histogram.get(&0).copied().unwrap_or(0),
                regions,
            },
        );
    }
    summary
}

/// The fully analyzed process table of a core dump.
pub struct CoreDumpAnalysis<'data> {
    /// The parsed region table.
    pub core: CoreDump<'data>,
    /// The walked heap chain, names resolved.
    pub heap: MemoryBlocks<'data>,
    /// Start address of the heap region.
    pub heap_address: u32,
    /// The reconstructed table in original insertion order.
    pub processes: Vec<ProcessSlot>,
    /// Per-length column histograms accumulated during extraction.
    pub stats: ProcessStructureStats,
    /// Whether the heuristic layout discovery ran.
    pub ran_heuristics: bool,
    /// The structure length elected by the heuristics.
    pub heuristics_size: Option<usize>,
    /// The discovered layout, when heuristics ran.
    pub heuristics_layout: Option<ProcessLayout>,
}

impl<'data> CoreDumpAnalysis<'data> {
    /// Analyzes a core dump: walks the heap, reconstructs the process table
    /// and runs heuristic layout discovery when too few structures match the
    /// known variants.
    pub fn parse(data: &'data [u8]) -> Result<Self, AnalysisError> {
        let core = CoreDump::parse(data)?;
        let (heap_address, heap_memory) = match core.region_heap() {
            Some((address, Some(memory))) => (address, memory),
            _ => return Err(AnalysisError::HeapRegionMissing),
        };
        let mut heap = MemoryBlocks::parse(heap_memory);
        heap.resolve_names(&core);

        let mut analysis = CoreDumpAnalysis {
            core,
            heap,
            heap_address,
            processes: Vec::new(),
            stats: ProcessStructureStats::new(),
            ran_heuristics: false,
            heuristics_size: None,
            heuristics_layout: None,
        };

        let addresses = analysis.walk_process_arrays();
        analysis.extract_processes(&addresses, None);

        let unsupported = analysis
            .processes
            .iter()
            .filter(|slot| {
                matches!(
                    slot.process.as_ref().and_then(|p| p.error),
                    Some(ProcessError::UnsupportedLength(_))
                )
            })
            .count();
        if !analysis.processes.is_empty()
            && unsupported as f64 / analysis.processes.len() as f64 >= HEURISTICS_THRESHOLD
        {
            analysis.run_heuristics();
            let heuristic = analysis
                .heuristics_size
                .zip(analysis.heuristics_layout);
            analysis.extract_processes(&addresses, heuristic);
        }
        Ok(analysis)
    }

    /// Recovers the process-structure addresses in original insertion order.
    ///
    /// Arrays chain head-to-terminal through their leading next-pointer; the
    /// terminal array (next = 0) is walked first and predecessors are
    /// prepended, restoring the original order.
    fn walk_process_arrays(&self) -> Vec<u32> {
        let mut by_next_address: HashMap<u32, &crate::block::MemoryBlock> = HashMap::new();
        let mut terminal = None;
        for block in self.heap.blocks_named("Process Array") {
            let payload = self.heap.block_data(block);
            let next = match payload.get(..4) {
                Some(bytes) => u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
                None => continue,
            };
            if next == 0 {
                terminal = Some(block);
            } else {
                by_next_address.insert(next, block);
            }
        }

        let mut addresses: Vec<u32> = Vec::new();
        let mut cursor = terminal;
        while let Some(block) = cursor {
            let payload = self.heap.block_data(block);
            let mut remaining = match payload.get(4..8) {
                Some(bytes) => u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
                None => 0,
            };
            let mut in_this_array = Vec::new();
            if let Some(slots) = payload.get(8..) {
                for word in slots.chunks_exact(4) {
                    if remaining == 0 {
                        break;
                    }
                    let address = u32::from_be_bytes([word[0], word[1], word[2], word[3]]);
                    // zero is a hole: it occupies a slot but is not counted
                    in_this_array.push(address);
                    if address != 0 {
                        remaining -= 1;
                    }
                }
            }
            in_this_array.extend_from_slice(&addresses);
            addresses = in_this_array;
            cursor = by_next_address.get(&block.data_address()).copied();
        }
        addresses
    }

    fn extract_processes(&mut self, addresses: &[u32], heuristic: Option<(usize, ProcessLayout)>) {
        self.processes.clear();
        for (index, &address) in addresses.iter().enumerate() {
            if address == 0 {
                continue;
            }
            let pid = index + 1;
            let process = self.heap.block_by_data_address(address).map(|block| {
                Process::parse(
                    pid,
                    self.heap.block_data(block),
                    &self.core,
                    &mut self.stats,
                    heuristic,
                )
            });
            self.processes.push(ProcessSlot {
                pid,
                address,
                process,
            });
        }
    }

    fn run_heuristics(&mut self) {
        self.ran_heuristics = true;
        // elect the structure length with the most constant columns
        let size = self
            .stats
            .iter()
            .max_by_key(|(_, columns)| {
                columns
                    .values()
                    .filter(|histogram| histogram.len() == 1)
                    .count()
            })
            .map(|(&size, _)| size);
        let size = match size {
            Some(size) => size,
            None => return,
        };
        self.heuristics_size = Some(size);

        let columns = match self.stats.get(&size) {
            Some(columns) => column_stats(columns, &self.core),
            None => return,
        };
        let mut layout = ProcessLayout {
            address_stack_block: Some(0x00),
            ..ProcessLayout::default()
        };

        // process name: the most varied pointer into the data region
        layout.address_process_name = columns
            .iter()
            .filter(|(&column, stats)| {
                stats.regions.contains(&"data") && stats.min != 0 && column > 1
            })
            .max_by_key(|(_, stats)| stats.distinct)
            .map(|(&column, _)| column * 4);

        // priority: the unique varied column within 2..=5
        layout.q = unique_column(&columns, |stats| {
            stats.distinct > 1 && stats.min >= 2 && stats.max <= 5
        });

        // type: the unique varied column starting at 0 with a small range
        layout.ty = unique_column(&columns, |stats| {
            stats.distinct > 1
                && stats.min == 0
                && stats.zero_count <= 2
                && (4..=10).contains(&stats.max)
        });

        self.heuristics_layout = Some(layout);
    }
}

/// Returns the byte offset of the single column satisfying `predicate`, or
/// `None` when the match is not unique.
fn unique_column<F>(columns: &BTreeMap<usize, ColumnStats>, predicate: F) -> Option<usize>
where
    F: Fn(&ColumnStats) -> bool,
{
    let mut found = None;
    for (&column, stats) in columns {
        if predicate(stats) {
            if found.is_some() {
                return None;
            }
            found = Some(column * 4);
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_layouts_closed_set() {
        for length in [692, 696, 712, 732, 744] {
            let layout = known_layout(length).unwrap();
            assert_eq!(layout.address_stack_block, Some(0x00));
        }
        assert_eq!(known_layout(700), None);
    }

    #[test]
    fn test_priority_and_type_rendering() {
        assert_eq!(priority_str(2), "C");
        assert_eq!(priority_str(5), "L");
        assert_eq!(priority_str(9), "9");
        assert_eq!(type_str(0), "*");
        assert_eq!(type_str(4), "we");
        assert_eq!(type_str(11), "11");
    }

    #[test]
    fn test_unique_column() {
        let mut columns = BTreeMap::new();
        columns.insert(
            3,
            ColumnStats {
                distinct: 3,
                min: 2,
                max: 5,
                ..ColumnStats::default()
            },
        );
        columns.insert(
            7,
            ColumnStats {
                distinct: 1,
                min: 2,
                max: 2,
                ..ColumnStats::default()
            },
        );
        let q = unique_column(&columns, |stats| {
            stats.distinct > 1 && stats.min >= 2 && stats.max <= 5
        });
        assert_eq!(q, Some(12));
    }
}
