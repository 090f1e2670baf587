//! World-server connection driver.
//!
//! Runs on the connection's reader thread: frames become client commands,
//! commands become engine tasks. The protocol state machine is small: a
//! connection is either awaiting login (only 0x0A legal) or logged in
//! (everything but login legal), and any protocol error closes it.

use std::net::TcpStream;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::accounts::AccountStore;
use crate::game::ctrl::PlayerCtrl;
use crate::game::engine::EngineHandle;
use crate::net::packet::{PacketReader, PacketWriter};
use crate::net::server::{read_frame, start_connection_writer, ConnectionId};
use crate::proto::game::{parse_client_command, ClientCommand, OPCODE_DISCONNECT};
use crate::world::creature::CreatureId;
use crate::world::item::ItemTypeIndex;

pub struct WorldSession {
    pub engine: EngineHandle,
    pub accounts: Arc<AccountStore>,
    pub item_types: Arc<ItemTypeIndex>,
}

impl WorldSession {
    /// Blocks until the connection ends; cleanup (despawn, close) happens on
    /// the way out so a dropped socket can never leak a player.
    pub fn run(&self, id: ConnectionId, mut stream: TcpStream) {
        let (sink, _writer) = match start_connection_writer(id, &stream) {
            Ok(split) => split,
            Err(err) => {
                debug!(connection = %id, "could not start writer: {}", err);
                return;
            }
        };
        let player_id = Arc::new(AtomicU32::new(0));

        loop {
            let frame = match read_frame(&mut stream) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(err) => {
                    debug!(connection = %id, "frame error: {}", err);
                    break;
                }
            };

            let mut reader = PacketReader::new(&frame);
            while !reader.is_empty() {
                let command = match parse_client_command(&mut reader) {
                    Ok(command) => command,
                    Err(err) => {
                        debug!(connection = %id, "protocol error: {}", err);
                        sink.close(true);
                        self.finish(&player_id);
                        return;
                    }
                };

                let pid = CreatureId(player_id.load(Ordering::SeqCst));
                if !pid.is_valid() {
                    // Awaiting login: nothing else is legal yet.
                    let ClientCommand::Login {
                        character_name,
                        password,
                        client_os,
                        client_version,
                    } = command
                    else {
                        debug!(connection = %id, "command before login");
                        sink.close(true);
                        return;
                    };
                    debug!(
                        connection = %id,
                        os = client_os,
                        version = client_version,
                        "login for {}",
                        character_name
                    );
                    if !self.accounts.character_exists(&character_name) {
                        refuse(&sink, "Invalid character.");
                        return;
                    }
                    if !self
                        .accounts
                        .verify_character_password(&character_name, &password)
                    {
                        refuse(&sink, "Invalid password.");
                        return;
                    }
                    let ctrl = PlayerCtrl::new(
                        sink.clone(),
                        Arc::clone(&player_id),
                        Arc::clone(&self.item_types),
                    );
                    self.engine.spawn(character_name, ctrl);
                    // The rest of the frame, if any, predates the login
                    // response; drop it.
                    break;
                }

                match command {
                    ClientCommand::Login { .. } => {
                        debug!(connection = %id, "second login on live session");
                        sink.close(true);
                        self.finish(&player_id);
                        return;
                    }
                    ClientCommand::Logout => self.engine.despawn(pid),
                    ClientCommand::Move(direction) => {
                        self.engine.move_creature(pid, direction)
                    }
                    ClientCommand::AutoWalk(path) => {
                        self.engine.move_path(pid, path.into_iter().collect())
                    }
                    ClientCommand::CancelMove => self.engine.cancel_move(pid),
                    ClientCommand::Turn(direction) => self.engine.turn(pid, direction),
                    ClientCommand::Say {
                        say_type,
                        receiver,
                        channel_id,
                        text,
                    } => self.engine.say(pid, say_type, text, receiver, channel_id),
                    ClientCommand::MoveItem { from, to, count } => {
                        self.engine.move_item(pid, from, to, count)
                    }
                    ClientCommand::UseItem {
                        item,
                        new_container_id,
                    } => self.engine.use_item(pid, item, new_container_id),
                    ClientCommand::CloseContainer { local_id } => {
                        self.engine.close_container(pid, local_id)
                    }
                    ClientCommand::LookAt(item) => self.engine.look_at(pid, item),
                }
            }
        }

        self.finish(&player_id);
        sink.close(false);
        info!(connection = %id, "session ended");
    }

    /// A session that got as far as logging in owes the engine a despawn.
    fn finish(&self, player_id: &Arc<AtomicU32>) {
        let pid = CreatureId(player_id.load(Ordering::SeqCst));
        if pid.is_valid() {
            self.engine.despawn(pid);
        }
    }
}

fn refuse(sink: &crate::net::server::PacketSink, reason: &str) {
    let mut writer = PacketWriter::new();
    writer.add_u8(OPCODE_DISCONNECT);
    writer.add_string_str(reason);
    sink.send(writer.into_vec());
    sink.close(false);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::engine::{EngineQueue, GameEngine};
    use crate::net::server::write_frame;
    use crate::proto::game::{OPCODE_LOGIN, OPCODE_PLAYER_SPAWN};
    use crate::world::state::testutil::empty_world;
    use std::net::TcpListener;
    use std::thread;

    const ACCOUNTS: &str = r#"<accounts>
  <account number="1" password="pw">
    <character name="Hero" worldName="Default" worldIp="127.0.0.1" worldPort="7172"/>
  </account>
</accounts>"#;

    fn login_frame(name: &str, password: &str) -> Vec<u8> {
        let mut writer = PacketWriter::new();
        writer.add_u8(OPCODE_LOGIN);
        writer.add_u8(0x02);
        writer.add_u8(0x01);
        writer.add_u16(0x0701);
        writer.add_u8(0x00);
        writer.add_string_str(name);
        writer.add_string_str(password);
        writer.into_vec()
    }

    /// Engine thread plus a session thread wired to a loopback client.
    fn start_server() -> (TcpStream, EngineHandle, thread::JoinHandle<()>) {
        let queue = Arc::new(EngineQueue::new());
        let accounts = Arc::new(AccountStore::from_xml(ACCOUNTS).expect("accounts"));
        let item_types = crate::world::state::testutil::test_item_types();

        let handle = EngineHandle::new(Arc::clone(&queue));
        let engine_accounts = Arc::clone(&accounts);
        let engine_thread = thread::spawn(move || {
            let world = empty_world(24, 24);
            GameEngine::new(queue, world, engine_accounts, "Hi.".to_string()).run();
        });

        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = TcpStream::connect(addr).expect("connect");
        let (server_stream, _) = listener.accept().expect("accept");

        let session = WorldSession {
            engine: handle.clone(),
            accounts,
            item_types,
        };
        thread::spawn(move || session.run(ConnectionId(99), server_stream));
        (client, handle, engine_thread)
    }

    #[test]
    fn login_then_logout_through_the_wire() {
        let (mut client, handle, engine_thread) = start_server();

        write_frame(&mut client, &login_frame("Hero", "pw")).expect("send login");
        let frame = read_frame(&mut client).expect("read").expect("spawn packet");
        assert_eq!(frame[0], OPCODE_PLAYER_SPAWN);

        // Logout: the engine answers with the poff and closes the stream.
        write_frame(&mut client, &[0x14]).expect("send logout");
        let frame = read_frame(&mut client).expect("read").expect("despawn packet");
        assert_eq!(frame[0], crate::proto::game::OPCODE_MAGIC_EFFECT);
        assert!(read_frame(&mut client).expect("read").is_none());

        handle.shutdown();
        engine_thread.join().expect("engine join");
    }

    #[test]
    fn wrong_password_is_refused_before_the_engine() {
        let (mut client, handle, engine_thread) = start_server();

        write_frame(&mut client, &login_frame("Hero", "nope")).expect("send login");
        let frame = read_frame(&mut client).expect("read").expect("refusal");
        assert_eq!(frame[0], OPCODE_DISCONNECT);
        assert_eq!(&frame[3..], b"Invalid password.");
        assert!(read_frame(&mut client).expect("read").is_none());

        handle.shutdown();
        engine_thread.join().expect("engine join");
    }

    #[test]
    fn command_before_login_drops_the_connection() {
        let (mut client, handle, engine_thread) = start_server();

        write_frame(&mut client, &[0x65]).expect("send step");
        assert!(matches!(read_frame(&mut client), Ok(None) | Err(_)));

        handle.shutdown();
        engine_thread.join().expect("engine join");
    }
}
