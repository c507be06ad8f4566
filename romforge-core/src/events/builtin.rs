//! Space events that ship with the engine.

use std::collections::HashMap;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};

use super::recognize::{matches_all, windows_excluding, HashWindow};
use super::{
    arg_block_len, ActivationType, EventCache, EventDefinition, EventInstance, ExecutionType,
    PlacementContext, WriteScratch,
};
use crate::game::Game;
use crate::mips::{
    encode_all, extract_jal_target, scan_function_length, split_address_for_load, Instruction,
    Reg,
};
use crate::symbols::{Symbol, SymbolLookup};
use crate::Result;

pub const ADJUST_COINS: &str = "ADJUST_COINS";
pub const WARP_TO_SPACE: &str = "WARP_TO_SPACE";
pub const CHAIN_SPLIT: &str = "CHAIN_SPLIT";
pub const SHARED_DIALOG: &str = "SHARED_DIALOG";
pub const CHECKPOINT: &str = "CHECKPOINT";

const WARP_SOUND: i16 = 0x4D;
const DIALOG_MESSAGE: i16 = 0x28;
const CHECKPOINT_COUNTER: &str = "checkpoint";

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Behavior {
    AdjustCoins,
    WarpToSpace,
    ChainSplit,
    SharedDialog,
    Checkpoint,
}

/// Code for one placement plus the words that vary between placements.
struct Emitted {
    code: Vec<u8>,
    variable_words: Vec<usize>,
    /// Bytes covered by recognition. Anything after is helper code.
    handler_len: usize,
}

pub struct BuiltinEvent {
    id: &'static str,
    name: &'static str,
    activation: ActivationType,
    execution: ExecutionType,
    games: Vec<Game>,
    shared_asm: bool,
    inline_args: usize,
    behavior: Behavior,
    windows: HashMap<Game, Vec<HashWindow>>,
}

/// Resolves every name to one fixed address, for canonical emission.
struct PlaceholderSymbols;

impl SymbolLookup for PlaceholderSymbols {
    fn symbols(&self, _game: Game) -> &[Symbol] {
        &[]
    }

    fn find(&self, _game: Game, _name: &str) -> Option<u32> {
        Some(0x8000_1000)
    }
}

fn open_frame() -> [Instruction; 2] {
    [
        Instruction::Addiu {
            rt: Reg::SP,
            rs: Reg::SP,
            imm: -0x18,
        },
        Instruction::Sw {
            rt: Reg::RA,
            base: Reg::SP,
            offset: 0x10,
        },
    ]
}

fn close_frame() -> [Instruction; 3] {
    [
        Instruction::Lw {
            rt: Reg::RA,
            base: Reg::SP,
            offset: 0x10,
        },
        Instruction::Jr { rs: Reg::RA },
        Instruction::Addiu {
            rt: Reg::SP,
            rs: Reg::SP,
            imm: 0x18,
        },
    ]
}

fn call(target: u32) -> [Instruction; 2] {
    [Instruction::Jal { target }, Instruction::Nop]
}

/// `lui base, hi(addr)` + `lh rt, lo(addr)(base)`.
fn load_half(rt: Reg, base: Reg, addr: u32) -> [Instruction; 2] {
    let (upper, lower) = split_address_for_load(addr);
    [
        Instruction::Lui { rt: base, imm: upper },
        Instruction::Lh {
            rt,
            base,
            offset: lower as i16,
        },
    ]
}

fn arg_address(ctx: &PlacementContext, args: usize, index: usize) -> u32 {
    ctx.address()
        .wrapping_sub(arg_block_len(args) as u32)
        .wrapping_add(2 * index as u32)
}

fn current_player(ctx: &PlacementContext) -> Result<Vec<Instruction>> {
    let mut code = call(ctx.symbol("GetCurrentPlayerIndex")?).to_vec();
    code.push(Instruction::Addu {
        rd: Reg::A0,
        rs: Reg::V0,
        rt: Reg::ZERO,
    });
    Ok(code)
}

fn default_chain_helper(ctx: &PlacementContext) -> Result<Vec<u8>> {
    let mut code = open_frame().to_vec();
    code.extend(call(ctx.symbol("ChooseChainPath")?));
    code.extend(close_frame());
    encode_all(&code)
}

const CHAIN_HELPER_CALL_WORD: usize = 6;
const CHAIN_HANDLER_WORDS: usize = 11;

impl BuiltinEvent {
    fn emit(
        &self,
        ctx: &PlacementContext,
        scratch: &mut WriteScratch,
        cache: &EventCache,
    ) -> Result<Emitted> {
        let mut code = open_frame().to_vec();
        let variable_words;
        let mut helper = Vec::new();

        match self.behavior {
            Behavior::AdjustCoins => {
                code.extend(current_player(ctx)?);
                code.extend(load_half(Reg::A1, Reg::T0, arg_address(ctx, 1, 0)));
                code.extend(call(ctx.symbol("AdjustPlayerCoins")?));
                variable_words = vec![2, 5, 6, 7];
            }
            Behavior::WarpToSpace => {
                code.extend(current_player(ctx)?);
                code.extend(load_half(Reg::A1, Reg::T0, arg_address(ctx, 1, 0)));
                code.extend(call(ctx.symbol("WarpPlayerToSpace")?));
                code.push(Instruction::Addiu {
                    rt: Reg::A0,
                    rs: Reg::ZERO,
                    imm: WARP_SOUND,
                });
                code.extend(call(ctx.symbol("PlaySound")?));
                variable_words = vec![2, 5, 6, 7, 10];
            }
            Behavior::ChainSplit => {
                code.extend(load_half(Reg::A0, Reg::A0, arg_address(ctx, 2, 0)));
                code.extend(load_half(Reg::A1, Reg::A1, arg_address(ctx, 2, 1)));
                let helper_address = ctx.address() + 4 * CHAIN_HANDLER_WORDS as u32;
                code.extend(call(helper_address));
                helper = match cache.helper(ctx.game, self.id) {
                    Some(body) => body.to_vec(),
                    None => default_chain_helper(ctx)?,
                };
                variable_words = vec![2, 3, 4, 5, CHAIN_HELPER_CALL_WORD];
            }
            Behavior::SharedDialog => {
                code.push(Instruction::Addiu {
                    rt: Reg::A0,
                    rs: Reg::ZERO,
                    imm: -1,
                });
                code.push(Instruction::Jal {
                    target: ctx.symbol("ShowMessage")?,
                });
                code.push(Instruction::Addiu {
                    rt: Reg::A1,
                    rs: Reg::ZERO,
                    imm: DIALOG_MESSAGE,
                });
                code.extend(call(ctx.symbol("CloseMessage")?));
                variable_words = vec![3, 5];
            }
            Behavior::Checkpoint => {
                let index = scratch.next(CHECKPOINT_COUNTER);
                let imm = i16::try_from(index).map_err(|_| {
                    crate::RomError::Capacity(format!("more than {} checkpoints", i16::MAX))
                })?;
                code.extend(current_player(ctx)?);
                code.push(Instruction::Jal {
                    target: ctx.symbol("SetPlayerCheckpoint")?,
                });
                code.push(Instruction::Addiu {
                    rt: Reg::A1,
                    rs: Reg::ZERO,
                    imm,
                });
                variable_words = vec![2, 5, 6];
            }
        }

        code.extend(close_frame());
        let mut bytes = encode_all(&code)?;
        let handler_len = bytes.len();
        bytes.extend_from_slice(&helper);
        Ok(Emitted {
            code: bytes,
            variable_words,
            handler_len,
        })
    }

    fn new(
        id: &'static str,
        name: &'static str,
        activation: ActivationType,
        games: &[Game],
        behavior: Behavior,
    ) -> Self {
        Self {
            id,
            name,
            activation,
            execution: ExecutionType::Direct,
            games: games.to_vec(),
            shared_asm: behavior == Behavior::SharedDialog,
            inline_args: match behavior {
                Behavior::AdjustCoins | Behavior::WarpToSpace => 1,
                Behavior::ChainSplit => 2,
                Behavior::SharedDialog | Behavior::Checkpoint => 0,
            },
            behavior,
            windows: HashMap::new(),
        }
    }

    /// Emits a canonical instance per game and keeps digests of the words
    /// that do not depend on placement.
    fn with_digests(mut self) -> Result<Self> {
        let symbols = PlaceholderSymbols;
        for &game in &self.games {
            let ctx = PlacementContext::new(game, 0x8010_0000, &symbols).at(0x10);
            let emitted = self.emit(&ctx, &mut WriteScratch::new(), &EventCache::new())?;
            let windows =
                windows_excluding(&emitted.code[..emitted.handler_len], &emitted.variable_words);
            self.windows.insert(game, windows);
        }
        Ok(self)
    }

    fn read_args(&self, view: &[u8], offset: usize) -> Option<Vec<i16>> {
        let block = arg_block_len(self.inline_args);
        let start = offset.checked_sub(block)?;
        let bytes = view.get(start..offset)?;
        Some(
            (0..self.inline_args)
                .map(|i| BigEndian::read_i16(&bytes[i * 2..]))
                .collect(),
        )
    }

    fn cache_chain_helper(&self, view: &[u8], ctx: &PlacementContext, cache: &mut EventCache) {
        let call_at = ctx.offset + CHAIN_HELPER_CALL_WORD * 4;
        let Some(word) = view.get(call_at..call_at + 4).map(BigEndian::read_u32) else {
            return;
        };
        let Ok(target) = extract_jal_target(word) else {
            return;
        };
        let helper_ram = (ctx.ram_base & 0xF000_0000) | target;
        let Some(helper_offset) = ctx.offset_of(helper_ram) else {
            return;
        };
        if let Some(len) = scan_function_length(view, helper_offset) {
            cache.store_helper(
                ctx.game,
                self.id,
                view[helper_offset..helper_offset + len].to_vec(),
            );
        }
    }
}

impl EventDefinition for BuiltinEvent {
    fn id(&self) -> &str {
        self.id
    }

    fn name(&self) -> &str {
        self.name
    }

    fn activation(&self) -> ActivationType {
        self.activation
    }

    fn execution(&self) -> ExecutionType {
        self.execution
    }

    fn supported_games(&self) -> &[Game] {
        &self.games
    }

    fn shared_asm(&self) -> bool {
        self.shared_asm
    }

    fn inline_args(&self) -> usize {
        self.inline_args
    }

    fn recognize(
        &self,
        view: &[u8],
        ctx: &PlacementContext,
        cache: &mut EventCache,
    ) -> Option<EventInstance> {
        let windows = self.windows.get(&ctx.game)?;
        if !matches_all(view, ctx.offset, windows) {
            return None;
        }
        let args = self.read_args(view, ctx.offset)?;
        if self.behavior == Behavior::ChainSplit {
            self.cache_chain_helper(view, ctx, cache);
        }
        Some(EventInstance::new(self.id, args))
    }

    fn assemble(
        &self,
        _instance: &EventInstance,
        ctx: &PlacementContext,
        scratch: &mut WriteScratch,
        cache: &EventCache,
    ) -> Result<Vec<u8>> {
        Ok(self.emit(ctx, scratch, cache)?.code)
    }
}

/// Every built-in definition, digests computed.
pub fn definitions() -> Result<Vec<Arc<dyn EventDefinition>>> {
    use ActivationType::*;
    use Game::*;

    let all = Game::ALL;
    let later = [Mp2Us, Mp2Jp, Mp2Pal, Mp3Us, Mp3Jp, Mp3Pal];
    let specs = [
        (ADJUST_COINS, "Gain or lose coins", LandOn, &all[..], Behavior::AdjustCoins),
        (WARP_TO_SPACE, "Warp to space", LandOn, &all[..], Behavior::WarpToSpace),
        (CHAIN_SPLIT, "Chain split", WalkOver, &later[..], Behavior::ChainSplit),
        (SHARED_DIALOG, "Show message", LandOn, &all[..], Behavior::SharedDialog),
        (CHECKPOINT, "Checkpoint", BeginOrWalkOver, &all[..], Behavior::Checkpoint),
    ];

    let mut defs: Vec<Arc<dyn EventDefinition>> = Vec::with_capacity(specs.len());
    for (id, name, activation, games, behavior) in specs {
        defs.push(Arc::new(
            BuiltinEvent::new(id, name, activation, games, behavior).with_digests()?,
        ));
    }
    Ok(defs)
}

#[cfg(test)]
pub(crate) mod tests_support {
    pub const SYMBOLS: &[(&str, u32)] = &[
        ("GetCurrentPlayerIndex", 0x8003_5FE0),
        ("AdjustPlayerCoins", 0x8003_6260),
        ("WarpPlayerToSpace", 0x8003_9A10),
        ("PlaySound", 0x8004_AA88),
        ("ChooseChainPath", 0x8004_F1C4),
        ("ShowMessage", 0x8005_B6E4),
        ("CloseMessage", 0x8005_B788),
        ("SetPlayerCheckpoint", 0x8003_A000),
    ];
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{write_event, EventRegistry};
    use crate::symbols::SymbolTable;

    const RAM: u32 = 0x8010_0000;

    fn symbols_for(game: Game) -> SymbolTable {
        let mut table = SymbolTable::new();
        for (name, addr) in tests_support::SYMBOLS {
            table.insert(game, *name, *addr);
        }
        table
    }

    fn place(
        registry: &EventRegistry,
        buf: &mut [u8],
        ctx: &PlacementContext,
        id: &str,
        args: Vec<i16>,
        cache: &EventCache,
    ) -> u32 {
        let mut instance = registry.create(id, args).unwrap();
        write_event(buf, registry, &mut instance, ctx, &mut WriteScratch::new(), cache)
            .unwrap()
            .address
    }

    #[test]
    fn written_handlers_are_recognized_with_their_arguments() {
        let registry = EventRegistry::with_builtins().unwrap();
        let symbols = symbols_for(Game::Mp1Us);
        let ctx = PlacementContext::new(Game::Mp1Us, RAM, &symbols);
        let mut buf = vec![0u8; 0x400];

        let coins = place(&registry, &mut buf, &ctx.at(0x40), ADJUST_COINS, vec![-5], &EventCache::new());
        let warp = place(&registry, &mut buf, &ctx.at(0x100), WARP_TO_SPACE, vec![17], &EventCache::new());

        let mut cache = EventCache::new();
        let found = registry
            .recognize(&buf, &ctx.at((coins - RAM) as usize), &mut cache)
            .unwrap();
        assert_eq!((found.id.as_str(), found.args.clone()), (ADJUST_COINS, vec![-5]));

        let found = registry
            .recognize(&buf, &ctx.at((warp - RAM) as usize), &mut cache)
            .unwrap();
        assert_eq!((found.id.as_str(), found.args.clone()), (WARP_TO_SPACE, vec![17]));

        // Arbitrary bytes are a miss.
        assert!(registry.recognize(&buf, &ctx.at(0x300), &mut cache).is_none());
    }

    #[test]
    fn recognition_is_filtered_by_game() {
        let registry = EventRegistry::with_builtins().unwrap();
        let symbols = symbols_for(Game::Mp2Us);
        let ctx = PlacementContext::new(Game::Mp2Us, RAM, &symbols);
        let mut buf = vec![0u8; 0x200];
        let at = place(&registry, &mut buf, &ctx.at(0x20), CHAIN_SPLIT, vec![1, 2], &EventCache::new());

        let mut cache = EventCache::new();
        let mp1_symbols = symbols_for(Game::Mp1Us);
        let mp1 = PlacementContext::new(Game::Mp1Us, RAM, &mp1_symbols).at((at - RAM) as usize);
        assert!(registry.recognize(&buf, &mp1, &mut cache).is_none());

        let found = registry
            .recognize(&buf, &ctx.at((at - RAM) as usize), &mut cache)
            .unwrap();
        assert_eq!(found.id, CHAIN_SPLIT);
        assert_eq!(found.args, vec![1, 2]);
    }

    #[test]
    fn chain_helper_is_cached_and_reused() {
        let registry = EventRegistry::with_builtins().unwrap();
        let symbols = symbols_for(Game::Mp3Us);
        let ctx = PlacementContext::new(Game::Mp3Us, RAM, &symbols);
        let mut original = vec![0u8; 0x200];
        let at = place(&registry, &mut original, &ctx.at(0x10), CHAIN_SPLIT, vec![0, 3], &EventCache::new());

        // Make the helper body distinctive, then recognize it.
        let helper_offset = (at - RAM) as usize + CHAIN_HANDLER_WORDS * 4;
        original[helper_offset + 8..helper_offset + 12].copy_from_slice(&0x2404_0007u32.to_be_bytes());
        let mut cache = EventCache::new();
        registry
            .recognize(&original, &ctx.at((at - RAM) as usize), &mut cache)
            .unwrap();
        let helper = cache.helper(Game::Mp3Us, CHAIN_SPLIT).unwrap().to_vec();
        assert_eq!(helper.len(), 7 * 4);

        let mut rewritten = vec![0u8; 0x200];
        let at2 = place(&registry, &mut rewritten, &ctx.at(0x80), CHAIN_SPLIT, vec![0, 3], &cache);
        let start = (at2 - RAM) as usize + CHAIN_HANDLER_WORDS * 4;
        assert_eq!(&rewritten[start..start + helper.len()], &helper[..]);
    }

    #[test]
    fn checkpoints_number_themselves_per_pass() {
        let registry = EventRegistry::with_builtins().unwrap();
        let symbols = symbols_for(Game::Mp2Us);
        let ctx = PlacementContext::new(Game::Mp2Us, RAM, &symbols);
        let def = registry.get(CHECKPOINT).unwrap();
        let instance = registry.create(CHECKPOINT, vec![]).unwrap();
        let mut scratch = WriteScratch::new();
        let cache = EventCache::new();

        let a = def.assemble(&instance, &ctx, &mut scratch, &cache).unwrap();
        let b = def.assemble(&instance, &ctx, &mut scratch, &cache).unwrap();
        assert_eq!(BigEndian::read_u32(&a[24..]) & 0xFFFF, 0);
        assert_eq!(BigEndian::read_u32(&b[24..]) & 0xFFFF, 1);
    }

    #[test]
    fn missing_symbols_fail_with_the_game_named() {
        let registry = EventRegistry::with_builtins().unwrap();
        let empty = SymbolTable::new();
        let ctx = PlacementContext::new(Game::Mp2Us, RAM, &empty);
        let def = registry.get(ADJUST_COINS).unwrap();
        let instance = registry.create(ADJUST_COINS, vec![1]).unwrap();
        let err = def
            .assemble(&instance, &ctx, &mut WriteScratch::new(), &EventCache::new())
            .unwrap_err();
        assert!(err.to_string().contains("GetCurrentPlayerIndex"));
        assert!(err.to_string().contains("NMWE"));
    }
}
