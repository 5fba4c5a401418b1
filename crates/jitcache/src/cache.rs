use crate::{
    Address, BlockId, BlockKey, MemoryMap,
    block::{Block, BlockInstruction, GeneratedCode},
    dispatch::{DispatchError, DispatchTable, Slot},
    fastmem::{FastmemArea, FastmemError, FaultContext, FaultOutcome},
    hooks::{Codegen, CodegenError, DecodeError, ExecState, InstructionSet},
    store::BlockStore,
};
use easyerr::Error;
use jitmem::{CodeArena, VmError};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Maximum number of instructions per block.
    pub max_block_instructions: u32,
    /// Whether instructions that can raise guest exceptions terminate their
    /// block. Required for precise exception semantics.
    pub trap_ends_block: bool,
    /// Capacity of the executable code arena in bytes. When a block does not
    /// fit anymore, the whole cache is flushed and the arena reclaimed.
    pub code_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_block_instructions: 128,
            trap_ends_block: true,
            code_capacity: 32 << 20,
        }
    }
}

#[derive(Debug, Error)]
pub enum CompileError {
    #[error(transparent)]
    Dispatch { source: DispatchError },
    #[error(transparent)]
    Decode { source: DecodeError },
}

#[derive(Debug, Error)]
pub enum RevalidateError {
    #[error("stale block handle")]
    Stale,
    #[error("block at {pc} is no longer executable")]
    NoLongerExecutable { pc: Address },
}

/// The translation cache.
///
/// Owns every block, the PC indexed dispatch table, the per page and per
/// host-address indices, and the executable code arena. All state is mutated
/// from the thread running guest code; the only re-entrant path is
/// [`CodeCache::handle_fault`], which runs synchronously on a hardware trap.
pub struct CodeCache<I, G> {
    map: MemoryMap,
    settings: Settings,

    interp: I,
    codegen: Option<G>,

    store: BlockStore,
    /// Primary table: key bits to block handle.
    blocks: FxHashMap<u32, BlockId>,
    /// RAM code page index to the blocks overlapping it.
    page_blocks: Vec<Vec<BlockId>>,
    /// Generated entry address to owning block, ordered for resolving an
    /// arbitrary host PC to the block containing it.
    host_blocks: BTreeMap<usize, BlockId>,

    table: DispatchTable,
    arena: CodeArena,
    fastmem: Option<FastmemArea>,

    use_compiler: bool,
    use_fastmem: bool,

    /// The block executed last by one of the run loops, for chaining it to
    /// its successor.
    last_executed: Option<BlockId>,
}

impl<I, G> CodeCache<I, G>
where
    I: InstructionSet,
    G: Codegen,
{
    pub fn new(map: MemoryMap, settings: Settings, interp: I, codegen: Option<G>) -> Self {
        let use_compiler = codegen.is_some();
        let table = DispatchTable::new(&map);
        let page_blocks = vec![Vec::new(); map.page_count() as usize];
        let arena = CodeArena::with_capacity(settings.code_capacity);

        Self {
            map,
            settings,
            interp,
            codegen,
            store: BlockStore::with_key(),
            blocks: FxHashMap::default(),
            page_blocks,
            host_blocks: BTreeMap::new(),
            table,
            arena,
            fastmem: None,
            use_compiler,
            use_fastmem: false,
            last_executed: None,
        }
    }

    pub fn map(&self) -> &MemoryMap {
        &self.map
    }

    pub fn interp(&self) -> &I {
        &self.interp
    }

    pub fn interp_mut(&mut self) -> &mut I {
        &mut self.interp
    }

    pub fn codegen(&self) -> Option<&G> {
        self.codegen.as_ref()
    }

    pub fn fastmem(&self) -> Option<&FastmemArea> {
        self.fastmem.as_ref()
    }

    /// Whether new blocks attempt native generation.
    pub fn compiler_enabled(&self) -> bool {
        self.use_compiler
    }

    /// Whether the fastmem mapping is active.
    pub fn fastmem_enabled(&self) -> bool {
        self.use_fastmem
    }

    pub fn dispatch_table(&self) -> &DispatchTable {
        &self.table
    }

    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.store.get(id)
    }

    /// Number of live blocks.
    pub fn block_count(&self) -> usize {
        self.store.len()
    }

    /// The key identifying the block for the current execution state.
    pub fn key_for(&self, state: &ExecState) -> BlockKey {
        BlockKey::new(state.pc, state.user_mode)
    }

    /// Looks a key up in the primary table.
    pub fn lookup(&self, key: BlockKey) -> Option<BlockId> {
        self.blocks
            .get(&key.bits())
            .copied()
            .filter(|id| self.store.get(*id).is_some())
    }

    /// Resolves the current PC to an executable block, compiling or
    /// revalidating as needed.
    pub fn block_for_pc(&mut self, state: &ExecState) -> Result<BlockId, CompileError> {
        let key = self.key_for(state);

        if let Some(id) = self.lookup(key) {
            if self.store.get(id).is_some_and(|b| !b.invalidated) {
                return Ok(id);
            }

            // stale contents; revived in place if the memory still matches,
            // otherwise the block was flushed and is recompiled below
            if self.revalidate(id).is_ok() {
                return Ok(id);
            }
        }

        self.compile(key)
    }

    /// Checks whether an invalidated block still matches guest memory and
    /// revives it, avoiding regeneration. If the backing memory changed or
    /// can no longer be decoded, the block is flushed and the caller must
    /// recompile or re-dispatch.
    pub fn revalidate(&mut self, id: BlockId) -> Result<(), RevalidateError> {
        let Some(block) = self.store.get(id) else {
            return Err(RevalidateError::Stale);
        };

        if !block.invalidated {
            return Ok(());
        }

        let key = block.key;
        let mut unchanged = true;
        for (index, instr) in block.instructions.iter().enumerate() {
            let pc = key.pc() + index as u32 * 4;
            match self.interp.decode(pc, key.user_mode()) {
                Ok(decoded) if decoded.bits == instr.bits => {}
                _ => {
                    unchanged = false;
                    break;
                }
            }
        }

        if !unchanged {
            tracing::debug!(pc = ?key.pc(), "block no longer matches memory, flushing");
            self.flush_block(id);
            return Err(RevalidateError::NoLongerExecutable { pc: key.pc() });
        }

        let entry = if let Some(block) = self.store.get_mut(id) {
            block.invalidated = false;
            block.recompile_count += 1;
            block.entry()
        } else {
            return Err(RevalidateError::Stale);
        };

        self.add_to_page_map(id);
        if let Some(entry) = entry {
            let _ = self.table.set(key.pc(), entry);
        }

        tracing::debug!(pc = ?key.pc(), "block revalidated");
        Ok(())
    }

    /// Decodes and compiles a new block starting at `key`.
    ///
    /// Native generation failure is not an error: the block is kept for
    /// interpreted execution and its dispatch slot stays on the compile
    /// path.
    pub fn compile(&mut self, key: BlockKey) -> Result<BlockId, CompileError> {
        // reject undispatchable targets before touching any state
        self.table
            .get(key.pc())
            .map_err(|source| CompileError::Dispatch { source })?;

        let _span = tracing::trace_span!("compile", pc = ?key.pc()).entered();

        let instructions = self.decode_run(key)?;
        let mut block = Block::new(key, instructions);

        let generated = self.generate_for(key, &block.instructions);
        block.generated = generated;

        let generated = block
            .generated
            .as_ref()
            .map(|code| (code.entry_addr(), code.entry));

        let id = self.store.insert(block);
        self.blocks.insert(key.bits(), id);
        self.add_to_page_map(id);

        if let Some((addr, entry)) = generated {
            self.host_blocks.insert(addr, id);
            let _ = self.table.set(key.pc(), entry);
        }

        tracing::trace!(pc = ?key.pc(), "block compiled");
        Ok(id)
    }

    /// Runs the generator for a block. When the code arena has no room left,
    /// the whole cache is flushed to reclaim it and generation retried once.
    fn generate_for(
        &mut self,
        key: BlockKey,
        instructions: &[BlockInstruction],
    ) -> Option<GeneratedCode> {
        if !self.use_compiler {
            return None;
        }

        let err = match self
            .codegen
            .as_mut()?
            .generate(key, instructions, &mut self.arena)
        {
            Ok(code) => return Some(code),
            Err(err) => err,
        };

        if let CodegenError::Memory {
            source: VmError::Capacity { .. },
        } = err
        {
            tracing::debug!(used = self.arena.used(), "code arena full, flushing all blocks");
            self.flush_all();

            match self
                .codegen
                .as_mut()?
                .generate(key, instructions, &mut self.arena)
            {
                Ok(code) => return Some(code),
                Err(err) => {
                    tracing::warn!(pc = ?key.pc(), "native generation failed: {err}");
                    return None;
                }
            }
        }

        tracing::warn!(pc = ?key.pc(), "native generation failed: {err}");
        None
    }

    /// Decodes a straight-line run of instructions starting at `key`,
    /// stopping after a branch and its delay slot, at an instruction that
    /// can trap, or at the instruction limit.
    fn decode_run(&mut self, key: BlockKey) -> Result<Vec<BlockInstruction>, CompileError> {
        let mut instructions = Vec::new();
        let mut pc = key.pc();
        let mut in_delay_slot = false;
        let mut prev_load_delay = false;

        loop {
            let decoded = match self.interp.decode(pc, key.user_mode()) {
                Ok(decoded) => decoded,
                Err(source) => {
                    if instructions.is_empty() {
                        return Err(CompileError::Decode { source });
                    }

                    tracing::debug!(?pc, "truncating block: {source}");
                    break;
                }
            };

            let mut flags = decoded.flags;
            flags.set_is_branch_delay_slot(in_delay_slot);
            flags.set_is_load_delay_slot(prev_load_delay);

            instructions.push(BlockInstruction {
                bits: decoded.bits,
                pc,
                flags,
            });

            if in_delay_slot {
                break;
            }

            if flags.is_branch() {
                in_delay_slot = true;
            } else if self.settings.trap_ends_block && flags.can_trap() {
                break;
            } else if instructions.len() as u32 >= self.settings.max_block_instructions {
                break;
            }

            prev_load_delay = flags.has_load_delay();
            pc += 4;
        }

        if let Some(last) = instructions.last_mut() {
            last.flags.set_is_last(true);
        }

        Ok(instructions)
    }

    fn add_to_page_map(&mut self, id: BlockId) {
        let Some(block) = self.store.get(id) else {
            return;
        };
        let Some(range) = block.page_range(&self.map) else {
            return;
        };

        for page in range {
            let list = &mut self.page_blocks[page as usize];
            if !list.contains(&id) {
                list.push(id);
            }
        }
    }

    fn remove_from_page_map(&mut self, id: BlockId) {
        let Some(block) = self.store.get(id) else {
            return;
        };
        let Some(range) = block.page_range(&self.map) else {
            return;
        };

        for page in range {
            self.page_blocks[page as usize].retain(|other| *other != id);
        }
    }

    /// Records a direct control transfer edge so that `from`'s compiled exit
    /// may jump straight into `to`, bypassing the dispatch table. Only legal
    /// between two valid blocks; anything else is ignored.
    pub fn link(&mut self, from: BlockId, to: BlockId) {
        let valid =
            |store: &BlockStore, id| store.get(id).is_some_and(|b: &Block| !b.invalidated);
        if !valid(&self.store, from) || !valid(&self.store, to) {
            return;
        }

        if self
            .store
            .get(from)
            .is_some_and(|b| b.successors.contains(&to))
        {
            return;
        }

        if let Some(block) = self.store.get_mut(from) {
            block.successors.push(to);
        }
        if let Some(block) = self.store.get_mut(to) {
            block.predecessors.push(from);
        }

        tracing::trace!(?from, ?to, "blocks linked");
    }

    /// Severs every edge where `id` is either end. Neighbors fall back to
    /// dispatch table lookups at their exits.
    pub fn unlink(&mut self, id: BlockId) {
        let Some(block) = self.store.get_mut(id) else {
            return;
        };

        let successors = std::mem::take(&mut block.successors);
        let predecessors = std::mem::take(&mut block.predecessors);

        for successor in successors {
            if let Some(block) = self.store.get_mut(successor) {
                block.predecessors.retain(|p| *p != id);
            }
        }

        for predecessor in predecessors {
            if let Some(block) = self.store.get_mut(predecessor) {
                block.successors.retain(|s| *s != id);
            }
        }
    }

    /// Marks every block overlapping the given RAM code page as invalidated
    /// and severs its links. The blocks themselves stay allocated; the cost
    /// of re-checking them is deferred to their next execution.
    ///
    /// The memory bus must call this for every store landing in a page that
    /// has ever held cached code.
    pub fn invalidate_page(&mut self, page: u32) {
        let Some(list) = self.page_blocks.get_mut(page as usize) else {
            tracing::warn!(page, "invalidated page is out of range");
            return;
        };

        if list.is_empty() {
            return;
        }

        let affected = std::mem::take(list);
        tracing::debug!(page, blocks = affected.len(), "invalidating code page");

        for id in affected {
            let Some(block) = self.store.get_mut(id) else {
                continue;
            };

            block.invalidated = true;
            let pc = block.pc();

            let _ = self.table.clear(pc);
            self.remove_from_page_map(id);
            self.unlink(id);
        }
    }

    /// Removes a block from every index and destroys it. Its generated code
    /// bytes stay in the arena until the next full flush.
    pub fn flush_block(&mut self, id: BlockId) {
        self.unlink(id);
        self.remove_from_page_map(id);

        let Some(block) = self.store.remove(id) else {
            return;
        };

        if self.blocks.get(&block.key.bits()) == Some(&id) {
            self.blocks.remove(&block.key.bits());
        }

        if let Some(code) = &block.generated {
            self.host_blocks.remove(&code.entry_addr());
        }

        let _ = self.table.clear(block.pc());

        if self.last_executed == Some(id) {
            self.last_executed = None;
        }

        tracing::debug!(pc = ?block.pc(), "block flushed");
    }

    /// Flushes every block, resets the dispatch table and reclaims all
    /// generated code.
    pub fn flush_all(&mut self) {
        tracing::debug!(blocks = self.store.len(), "flushing all blocks");

        self.blocks.clear();
        for list in &mut self.page_blocks {
            list.clear();
        }
        self.host_blocks.clear();
        self.store.clear();
        self.table.reset();
        self.last_executed = None;

        // SAFETY: every entry pointer into the arena was just dropped with
        // its block
        unsafe { self.arena.reset() };
    }

    /// Reconfigures whether new blocks attempt native generation and whether
    /// the fastmem mapping is installed. Flushes the whole cache.
    pub fn set_mode(&mut self, use_compiler: bool, use_fastmem: bool) -> Result<(), FastmemError> {
        self.flush_all();

        self.use_compiler = use_compiler && self.codegen.is_some();
        if use_compiler && self.codegen.is_none() {
            tracing::warn!("no code generator configured, staying on the interpreter");
        }
        if use_fastmem && !self.use_compiler {
            tracing::warn!("fastmem requires the native compiler, ignoring");
        }

        let want_fastmem = use_fastmem && self.use_compiler;
        self.use_fastmem = false;

        if want_fastmem {
            if self.fastmem.is_none() {
                self.fastmem = Some(FastmemArea::install(&self.map)?);
            }
            self.use_fastmem = true;
        } else if self.fastmem.take().is_some() {
            tracing::debug!("fastmem area unmapped");
        }

        Ok(())
    }

    /// Resolves a host page fault against the fastmem mapping.
    ///
    /// Runs synchronously on the faulting thread as a hardware trap: it must
    /// either redirect the access and report [`FaultOutcome::Handled`], or
    /// report [`FaultOutcome::NotHandled`] so the fault propagates as fatal.
    /// The resolution path performs no allocation and emits no trace events,
    /// and [`Codegen::backpatch`] must uphold the same.
    pub fn handle_fault(&mut self, ctx: FaultContext) -> FaultOutcome {
        if !self.use_fastmem {
            return FaultOutcome::NotHandled;
        }

        let Some(area) = &self.fastmem else {
            return FaultOutcome::NotHandled;
        };

        if area.guest_of(ctx.fault_addr).is_none() {
            return FaultOutcome::NotHandled;
        }

        // resolve the faulting host instruction back to its block
        let Some((_, id)) = self.host_blocks.range(..=ctx.host_pc).next_back() else {
            return FaultOutcome::NotHandled;
        };

        let Some(code) = self.store.get(*id).and_then(|b| b.generated.as_ref()) else {
            return FaultOutcome::NotHandled;
        };

        if !code.contains(ctx.host_pc) {
            return FaultOutcome::NotHandled;
        }

        let Some(site) = code
            .patch_sites
            .iter()
            .find(|site| site.host_pc == ctx.host_pc)
            .copied()
        else {
            return FaultOutcome::NotHandled;
        };

        let Some(codegen) = self.codegen.as_mut() else {
            return FaultOutcome::NotHandled;
        };

        if codegen.backpatch(site) {
            FaultOutcome::Handled
        } else {
            FaultOutcome::NotHandled
        }
    }

    /// Executes a cached block through the interpreter.
    pub fn interpret_cached(&mut self, state: &mut ExecState, id: BlockId) {
        let Some(block) = self.store.get(id) else {
            tracing::warn!("attempted to interpret a stale block");
            return;
        };

        for instr in &block.instructions {
            self.interp.execute(instr, state);
            if state.pending_events {
                break;
            }
        }
    }

    /// Decodes and executes instructions one at a time, without caching,
    /// until a branch and its delay slot complete.
    pub fn interpret_uncached(&mut self, state: &mut ExecState) -> Result<(), DecodeError> {
        let mut in_delay_slot = false;

        loop {
            let pc = state.pc;
            let decoded = self.interp.decode(pc, state.user_mode)?;

            let mut flags = decoded.flags;
            flags.set_is_branch_delay_slot(in_delay_slot);

            let instr = BlockInstruction {
                bits: decoded.bits,
                pc,
                flags,
            };
            self.interp.execute(&instr, state);

            if in_delay_slot || state.pending_events {
                break;
            }

            if flags.is_branch() {
                in_delay_slot = true;
            } else if self.settings.trap_ends_block && flags.can_trap() {
                break;
            }
        }

        Ok(())
    }

    /// Runs guest code through cached (or freshly compiled) blocks using the
    /// interpreter, until the execution state reports a pending event.
    pub fn run_interpreter(&mut self, state: &mut ExecState) -> Result<(), CompileError> {
        while !state.pending_events {
            let id = self.block_for_pc(state)?;

            if let Some(prev) = self.last_executed {
                self.link(prev, id);
            }
            self.last_executed = Some(id);

            self.interpret_cached(state, id);
        }

        Ok(())
    }

    /// Runs guest code through the dispatch table: compiled entries execute
    /// natively and chain through their links; everything else re-enters the
    /// cache, compiling on demand.
    pub fn run_compiled(&mut self, state: &mut ExecState) -> Result<(), CompileError> {
        while !state.pending_events {
            let slot = self
                .table
                .get(state.pc)
                .map_err(|source| CompileError::Dispatch { source })?;

            match slot {
                Slot::Compiled(entry) => {
                    if let Some(id) = self.lookup(self.key_for(state)) {
                        if let Some(prev) = self.last_executed {
                            self.link(prev, id);
                        }
                        self.last_executed = Some(id);
                    }

                    // the block updates the PC and may chain into linked
                    // successors before returning
                    unsafe { entry(&raw mut *state) };
                }
                Slot::NeedsCompile => {
                    let id = self.block_for_pc(state)?;

                    if let Some(prev) = self.last_executed {
                        self.link(prev, id);
                    }
                    self.last_executed = Some(id);

                    let entry = self.store.get(id).and_then(|b| b.entry());
                    match entry {
                        Some(entry) => unsafe { entry(&raw mut *state) },
                        None => self.interpret_cached(state, id),
                    }
                }
            }
        }

        Ok(())
    }
}
