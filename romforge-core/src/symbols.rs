use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};

use crate::game::Game;
use crate::{RomError, Result};

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Symbol {
    pub name: String,
    #[serde(deserialize_with = "address_from_json")]
    pub addr: u32,
}

/// Addresses may be written as numbers or as `"0x..."` strings.
fn address_from_json<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u32),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => {
            let t = s.trim();
            let parsed = match t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
                Some(hex) => u32::from_str_radix(hex, 16),
                None => t.parse::<u32>(),
            };
            parsed.map_err(|_| serde::de::Error::custom(format!("bad address '{s}'")))
        }
    }
}

/// Read-only symbol service consumed by event writers and the assembler.
pub trait SymbolLookup {
    fn symbols(&self, game: Game) -> &[Symbol];

    fn find(&self, game: Game, name: &str) -> Option<u32> {
        self.symbols(game)
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.addr)
    }
}

#[derive(Clone, Debug, Default)]
pub struct SymbolTable {
    by_game: HashMap<Game, Vec<Symbol>>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, game: Game, name: impl Into<String>, addr: u32) {
        let name = name.into();
        let list = self.by_game.entry(game).or_default();
        match list.iter_mut().find(|s| s.name == name) {
            Some(existing) => existing.addr = addr,
            None => list.push(Symbol { name, addr }),
        }
    }

    /// Parses `{ "NMWE": [{ "name": ..., "addr": ... }], ... }`.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let raw: HashMap<String, Vec<Symbol>> = serde_json::from_str(text)?;
        let mut table = Self::new();
        for (id, symbols) in raw {
            let game = Game::from_id(&id)
                .ok_or_else(|| RomError::Config(format!("unknown game id '{id}' in symbol file")))?;
            for s in symbols {
                table.insert(game, s.name, s.addr);
            }
        }
        Ok(table)
    }
}

impl SymbolLookup for SymbolTable {
    fn symbols(&self, game: Game) -> &[Symbol] {
        self.by_game.get(&game).map_or(&[], Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_numbers_and_hex_strings() {
        let json = r#"{
            "NMWE": [
                { "name": "PlaySound", "addr": "0x8004AA88" },
                { "name": "ShowMessage", "addr": 2147749888 }
            ],
            "NLXE": []
        }"#;
        let table = SymbolTable::from_json_str(json).unwrap();
        assert_eq!(table.find(Game::Mp2Us, "PlaySound"), Some(0x8004_AA88));
        assert_eq!(table.find(Game::Mp2Us, "ShowMessage"), Some(0x8004_1000));
        assert_eq!(table.find(Game::Mp1Us, "PlaySound"), None);
        assert!(table.symbols(Game::Mp3Us).is_empty());
    }

    #[test]
    fn rejects_unknown_games() {
        let err = SymbolTable::from_json_str(r#"{ "ZZZZ": [] }"#).unwrap_err();
        assert!(matches!(err, RomError::Config(_)));
    }

    #[test]
    fn insert_replaces_existing_names() {
        let mut table = SymbolTable::new();
        table.insert(Game::Mp3Us, "A", 1);
        table.insert(Game::Mp3Us, "A", 2);
        assert_eq!(table.symbols(Game::Mp3Us).len(), 1);
        assert_eq!(table.find(Game::Mp3Us, "A"), Some(2));
    }
}
