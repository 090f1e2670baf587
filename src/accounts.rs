//! Read-only account and character store, loaded once at boot.
//!
//! The legacy flat XML format: `<account number password premiumDays>`
//! wrapping `<character name worldName worldIp worldPort/>` entries.
//! Passwords are plaintext; the files predate anything better.

use std::collections::HashMap;
use std::path::Path;

use thiserror::Error;
use tracing::info;

use crate::xml::{attribute, XmlEvent, XmlScanner};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Character {
    pub name: String,
    pub world_name: String,
    /// Dotted quad packed first-octet-lowest, so the little-endian wire
    /// encoding reads back in address order.
    pub world_ip: u32,
    pub world_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub number: u32,
    pub premium_days: u16,
    pub characters: Vec<Character>,
}

#[derive(Debug, Error)]
pub enum AccountsError {
    #[error("could not read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("accounts file: {0}")]
    Malformed(String),
}

#[derive(Debug, Default)]
pub struct AccountStore {
    accounts: HashMap<u32, Account>,
    passwords: HashMap<u32, String>,
    character_to_account: HashMap<String, u32>,
}

impl AccountStore {
    pub fn load(path: &Path) -> Result<Self, AccountsError> {
        let xml = std::fs::read_to_string(path).map_err(|source| AccountsError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let store = Self::from_xml(&xml)?;
        info!(
            "loaded {} accounts ({} characters) from {}",
            store.accounts.len(),
            store.character_to_account.len(),
            path.display()
        );
        Ok(store)
    }

    pub fn from_xml(xml: &str) -> Result<Self, AccountsError> {
        let mut scanner = XmlScanner::new(xml);
        let mut store = Self::default();
        let mut current: Option<(Account, String)> = None;

        while let Some(event) = scanner.next_event() {
            match event {
                XmlEvent::Open { name, attributes, self_closing } => match name.as_str() {
                    "account" => {
                        if current.is_some() {
                            return Err(AccountsError::Malformed(
                                "nested <account>".to_string(),
                            ));
                        }
                        let number: u32 = attribute(&attributes, "number")
                            .and_then(|v| v.parse().ok())
                            .ok_or_else(|| {
                                AccountsError::Malformed(
                                    "<account> has no numeric number".to_string(),
                                )
                            })?;
                        let password = attribute(&attributes, "password")
                            .ok_or_else(|| {
                                AccountsError::Malformed(format!(
                                    "account {number} has no password"
                                ))
                            })?
                            .to_string();
                        let premium_days = attribute(&attributes, "premiumDays")
                            .and_then(|v| v.parse().ok())
                            .unwrap_or(0);
                        current = Some((
                            Account {
                                number,
                                premium_days,
                                characters: Vec::new(),
                            },
                            password,
                        ));
                        if self_closing {
                            if let Some((account, password)) = current.take() {
                                store.insert(account, password)?;
                            }
                        }
                    }
                    "character" => {
                        let Some((account, _)) = current.as_mut() else {
                            return Err(AccountsError::Malformed(
                                "<character> outside <account>".to_string(),
                            ));
                        };
                        let name = attribute(&attributes, "name")
                            .ok_or_else(|| {
                                AccountsError::Malformed("<character> has no name".to_string())
                            })?
                            .to_string();
                        let world_name = attribute(&attributes, "worldName")
                            .unwrap_or("Default")
                            .to_string();
                        let world_ip = attribute(&attributes, "worldIp")
                            .map(parse_dotted_quad)
                            .transpose()?
                            .unwrap_or_else(|| pack_ip([127, 0, 0, 1]));
                        let world_port = attribute(&attributes, "worldPort")
                            .and_then(|v| v.parse().ok())
                            .unwrap_or(7172);
                        account.characters.push(Character {
                            name,
                            world_name,
                            world_ip,
                            world_port,
                        });
                    }
                    _ => {}
                },
                XmlEvent::Close { name } if name == "account" => {
                    let Some((account, password)) = current.take() else {
                        return Err(AccountsError::Malformed(
                            "</account> without <account>".to_string(),
                        ));
                    };
                    store.insert(account, password)?;
                }
                XmlEvent::Close { .. } => {}
            }
        }
        Ok(store)
    }

    fn insert(&mut self, account: Account, password: String) -> Result<(), AccountsError> {
        for character in &account.characters {
            if self
                .character_to_account
                .insert(character.name.clone(), account.number)
                .is_some()
            {
                return Err(AccountsError::Malformed(format!(
                    "duplicate character name {}",
                    character.name
                )));
            }
        }
        let number = account.number;
        if self.accounts.insert(number, account).is_some() {
            return Err(AccountsError::Malformed(format!(
                "duplicate account number {number}"
            )));
        }
        self.passwords.insert(number, password);
        Ok(())
    }

    pub fn account_exists(&self, number: u32) -> bool {
        self.accounts.contains_key(&number)
    }

    pub fn get_account(&self, number: u32) -> Option<&Account> {
        self.accounts.get(&number)
    }

    pub fn verify_password(&self, number: u32, password: &str) -> bool {
        self.passwords
            .get(&number)
            .map(|stored| stored == password)
            .unwrap_or(false)
    }

    pub fn character_exists(&self, name: &str) -> bool {
        self.character_to_account.contains_key(name)
    }

    /// Password check keyed by character name, for the world server's login.
    pub fn verify_character_password(&self, name: &str, password: &str) -> bool {
        self.character_to_account
            .get(name)
            .map(|number| self.verify_password(*number, password))
            .unwrap_or(false)
    }
}

fn pack_ip(octets: [u8; 4]) -> u32 {
    u32::from(octets[0])
        | u32::from(octets[1]) << 8
        | u32::from(octets[2]) << 16
        | u32::from(octets[3]) << 24
}

fn parse_dotted_quad(text: &str) -> Result<u32, AccountsError> {
    let mut octets = [0u8; 4];
    let mut parts = text.split('.');
    for octet in &mut octets {
        *octet = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| AccountsError::Malformed(format!("bad ip address {text}")))?;
    }
    if parts.next().is_some() {
        return Err(AccountsError::Malformed(format!("bad ip address {text}")));
    }
    Ok(pack_ip(octets))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0"?>
<accounts>
  <account number="1" password="pw" premiumDays="0">
    <character name="Hero" worldName="Default" worldIp="127.0.0.1" worldPort="7172"/>
  </account>
  <account number="2" password="hunter2" premiumDays="90">
    <character name="Alice" worldName="Default" worldIp="10.0.0.1" worldPort="7172"/>
    <character name="Bob" worldName="Default" worldIp="10.0.0.1" worldPort="7172"/>
  </account>
</accounts>"#;

    #[test]
    fn loads_accounts_and_characters() {
        let store = AccountStore::from_xml(SAMPLE).expect("parse");
        assert!(store.account_exists(1));
        assert!(store.account_exists(2));
        assert!(!store.account_exists(3));

        let account = store.get_account(2).expect("account");
        assert_eq!(account.premium_days, 90);
        assert_eq!(account.characters.len(), 2);
        assert_eq!(account.characters[0].name, "Alice");
    }

    #[test]
    fn password_checks_by_number_and_by_character() {
        let store = AccountStore::from_xml(SAMPLE).expect("parse");
        assert!(store.verify_password(1, "pw"));
        assert!(!store.verify_password(1, "x"));
        assert!(store.verify_character_password("Bob", "hunter2"));
        assert!(!store.verify_character_password("Bob", "pw"));
        assert!(!store.verify_character_password("Ghost", "pw"));
        assert!(store.character_exists("Hero"));
        assert!(!store.character_exists("Ghost"));
    }

    #[test]
    fn ip_packs_first_octet_lowest() {
        let store = AccountStore::from_xml(SAMPLE).expect("parse");
        let hero = &store.get_account(1).expect("account").characters[0];
        // 127.0.0.1 serialises as 7f 00 00 01 in little-endian u32 order.
        assert_eq!(hero.world_ip.to_le_bytes(), [0x7f, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn duplicate_characters_are_rejected() {
        let xml = r#"<accounts>
  <account number="1" password="a"><character name="Twin"/></account>
  <account number="2" password="b"><character name="Twin"/></account>
</accounts>"#;
        assert!(matches!(
            AccountStore::from_xml(xml),
            Err(AccountsError::Malformed(_))
        ));
    }

    #[test]
    fn bad_ip_is_rejected() {
        let xml = r#"<accounts>
  <account number="1" password="a"><character name="Hero" worldIp="256.1"/></account>
</accounts>"#;
        assert!(matches!(
            AccountStore::from_xml(xml),
            Err(AccountsError::Malformed(_))
        ));
    }
}
