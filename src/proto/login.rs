//! Login-server wire protocol.
//!
//! One request, one response, close. The response always opens with the
//! message of the day; whether a character list or an error string follows
//! depends on the credentials.

use thiserror::Error;
use tracing::debug;

use crate::accounts::AccountStore;
use crate::net::packet::{PacketReader, PacketWriter};

pub const OPCODE_LOGIN: u8 = 0x01;
pub const OPCODE_MOTD: u8 = 0x14;
pub const OPCODE_LOGIN_ERROR: u8 = 0x0a;
pub const OPCODE_CHARACTER_LIST: u8 = 0x64;

const OS_INFO_LEN: usize = 12;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LoginError {
    #[error("login packet ended short")]
    Truncated,
    #[error("unexpected opcode 0x{0:02x}")]
    UnexpectedOpcode(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRequest {
    pub client_os: u16,
    pub client_version: u16,
    pub account_number: u32,
    pub password: String,
}

/// `clientOs:u16 | clientVersion:u16 | osInfo:12B | account:u32 | password`.
pub fn parse_login_request(reader: &mut PacketReader) -> Result<LoginRequest, LoginError> {
    let client_os = reader.get_u16().ok_or(LoginError::Truncated)?;
    let client_version = reader.get_u16().ok_or(LoginError::Truncated)?;
    reader.get_bytes(OS_INFO_LEN).ok_or(LoginError::Truncated)?;
    let account_number = reader.get_u32().ok_or(LoginError::Truncated)?;
    let password = reader.get_string_lossy().ok_or(LoginError::Truncated)?;
    Ok(LoginRequest {
        client_os,
        client_version,
        account_number,
        password,
    })
}

/// The full response body for a login request against the account store.
pub fn build_login_response(
    store: &AccountStore,
    motd: &str,
    request: &LoginRequest,
) -> Vec<u8> {
    let mut writer = PacketWriter::new();
    writer.add_u8(OPCODE_MOTD);
    writer.add_string_str(&format!("0\n{motd}"));

    if !store.account_exists(request.account_number) {
        debug!("login: account {} not found", request.account_number);
        writer.add_u8(OPCODE_LOGIN_ERROR);
        writer.add_string_str("Invalid account number");
    } else if !store.verify_password(request.account_number, &request.password) {
        debug!(
            "login: wrong password for account {}",
            request.account_number
        );
        writer.add_u8(OPCODE_LOGIN_ERROR);
        writer.add_string_str("Invalid password");
    } else if let Some(account) = store.get_account(request.account_number) {
        writer.add_u8(OPCODE_CHARACTER_LIST);
        writer.add_u8(account.characters.len().min(u8::MAX as usize) as u8);
        for character in &account.characters {
            writer.add_string_str(&character.name);
            writer.add_string_str(&character.world_name);
            writer.add_u32(character.world_ip);
            writer.add_u16(character.world_port);
        }
        writer.add_u16(account.premium_days);
    }
    writer.into_vec()
}

/// Handles one inbound frame. `Ok` carries the response to send before
/// closing; an unexpected opcode means close without responding.
pub fn handle_login_frame(
    store: &AccountStore,
    motd: &str,
    frame: &[u8],
) -> Result<Vec<u8>, LoginError> {
    let mut reader = PacketReader::new(frame);
    let opcode = reader.get_u8().ok_or(LoginError::Truncated)?;
    if opcode != OPCODE_LOGIN {
        return Err(LoginError::UnexpectedOpcode(opcode));
    }
    let request = parse_login_request(&mut reader)?;
    Ok(build_login_response(store, motd, &request))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACCOUNTS: &str = r#"<accounts>
  <account number="1" password="pw" premiumDays="0">
    <character name="Hero" worldName="Default" worldIp="127.0.0.1" worldPort="7172"/>
  </account>
</accounts>"#;

    fn login_frame(account: u32, password: &str) -> Vec<u8> {
        let mut writer = PacketWriter::new();
        writer.add_u8(OPCODE_LOGIN);
        writer.add_u16(0x0000);
        writer.add_u16(0x0701);
        writer.add_bytes(&[0u8; 12]);
        writer.add_u32(account);
        writer.add_string_str(password);
        writer.into_vec()
    }

    fn store() -> AccountStore {
        AccountStore::from_xml(ACCOUNTS).expect("accounts")
    }

    #[test]
    fn happy_path_lists_characters() {
        let response =
            handle_login_frame(&store(), "Welcome to the world.", &login_frame(1, "pw"))
                .expect("response");

        let mut reader = PacketReader::new(&response);
        assert_eq!(reader.get_u8(), Some(OPCODE_MOTD));
        assert_eq!(
            reader.get_string(),
            Some(b"0\nWelcome to the world.".to_vec())
        );
        assert_eq!(reader.get_u8(), Some(OPCODE_CHARACTER_LIST));
        assert_eq!(reader.get_u8(), Some(1));
        assert_eq!(reader.get_string(), Some(b"Hero".to_vec()));
        assert_eq!(reader.get_string(), Some(b"Default".to_vec()));
        // 127.0.0.1 then port 7172, both little-endian on the wire.
        let ip = reader.get_u32().expect("ip");
        assert_eq!(ip.to_le_bytes(), [0x7f, 0x00, 0x00, 0x01]);
        let port = reader.get_u16().expect("port");
        assert_eq!(port, 7172);
        assert_eq!(port.to_le_bytes(), [0x04, 0x1c]);
        assert_eq!(reader.get_u16(), Some(0)); // premium days
        assert!(reader.is_empty());
    }

    #[test]
    fn wrong_password_still_gets_the_motd() {
        let response = handle_login_frame(&store(), "motd", &login_frame(1, "x"))
            .expect("response");
        let mut reader = PacketReader::new(&response);
        assert_eq!(reader.get_u8(), Some(OPCODE_MOTD));
        assert_eq!(reader.get_string(), Some(b"0\nmotd".to_vec()));
        assert_eq!(reader.get_u8(), Some(OPCODE_LOGIN_ERROR));
        assert_eq!(reader.get_string(), Some(b"Invalid password".to_vec()));
        assert!(reader.is_empty());
    }

    #[test]
    fn unknown_account_is_an_error_string() {
        let response = handle_login_frame(&store(), "motd", &login_frame(9, "pw"))
            .expect("response");
        let mut reader = PacketReader::new(&response);
        reader.get_u8();
        reader.get_string();
        assert_eq!(reader.get_u8(), Some(OPCODE_LOGIN_ERROR));
        assert_eq!(
            reader.get_string(),
            Some(b"Invalid account number".to_vec())
        );
    }

    #[test]
    fn unexpected_opcode_closes_without_response() {
        assert_eq!(
            handle_login_frame(&store(), "motd", &[0x02, 0x00]),
            Err(LoginError::UnexpectedOpcode(0x02))
        );
    }

    #[test]
    fn truncated_login_is_an_error() {
        let mut frame = login_frame(1, "pw");
        frame.truncate(6);
        assert_eq!(
            handle_login_frame(&store(), "motd", &frame),
            Err(LoginError::Truncated)
        );
    }
}
