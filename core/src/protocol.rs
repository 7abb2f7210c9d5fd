//! HostLink: the half-duplex, byte-strobed link between the 8-bit host and
//! the flash disk controller.
//!
//! Physically the link moves one nibble per strobe over four data lines,
//! with a high nibble of flag bits (`RDY`/`BSY`/`ACK`/`DAT`) telling the host
//! what the low nibble means. Assembling nibble pairs into bytes is a GPIO
//! timing concern left to whatever drives the pins; what lives here is the
//! byte-level command state machine those assembled bytes drive; see
//! `marker` and `Command` for wire constants, and [`HostLink::on_host_byte`]
//! for the transition function itself.
//!
//! Grounded on `rc6502_fd.c`'s `ISR(INT0_vect)` (nibble assembly and the
//! immediate ACK/NACK/status decision) together with its `main()` state
//! switch and `handle_cmd_*` functions (the actual command semantics). The
//! original split those two concerns across an interrupt handler and a main
//! loop so the MCU's single core could keep pace with the host while also
//! doing page-at-a-time flash I/O; `on_host_byte` folds them into one
//! synchronous call so the whole thing is testable without a host link at
//! all. On hardware the `firmware` crate owns its own nibble-assembling
//! twin of this state machine outright from a single async task, so there
//! is no second task or interrupt handler to guard it against -- see that
//! crate's `protocol` module.

use crate::flash::{FlashDevice, PAGE_SIZE};
use crate::fs::{FileEntry, SimpleFs, ENTRY_SIZE, NAME_SIZE};

/// Bytes reserved for protocol framing rather than file data.
pub mod marker {
    /// Begin of data transfer.
    pub const BODT: u8 = 0x80;
    /// End of data transfer.
    pub const EODT: u8 = 0x8F;
    pub const ACK: u8 = 0xA0;
    pub const NACK: u8 = 0xAF;
}

/// Status flag bits carried in the high nibble of every byte the controller
/// places on the bus.
pub mod flags {
    pub const RDY: u8 = 0x80;
    pub const BSY: u8 = 0x40;
    pub const ACK: u8 = 0x20;
    pub const DAT: u8 = 0x10;
}

/// Commands the host may open a session with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Reset = 0x00,
    List = 0x01,
    Read = 0x02,
    Write = 0x03,
    Delete = 0x04,
}

impl Command {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(Command::Reset),
            0x01 => Some(Command::List),
            0x02 => Some(Command::Read),
            0x03 => Some(Command::Write),
            0x04 => Some(Command::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    ReceiveCmd,
    ReceiveData,
    SendData,
    /// A transfer's `EODT` has been sent; waiting for the host's closing
    /// handshake byte before dropping all the way back to `Idle`.
    Finish,
}

/// Half-duplex command/response state machine sitting on top of a
/// [`SimpleFs`]. One `HostLink` instance serves one host link session at a
/// time; a fresh [`Command::Reset`] returns it to a known state regardless
/// of what it was doing before.
pub struct HostLink<D: FlashDevice> {
    fs: SimpleFs<D>,
    state: State,
    command: Option<Command>,

    // Small name/spec buffer, sized like the original `buff_aux`.
    aux: [u8; NAME_SIZE],
    aux_len: usize,

    // One page, reused for both directions like the original `buff`.
    page: [u8; PAGE_SIZE],
    page_pos: usize,
    remaining: u32,

    // Scan position for an in-progress List session; restarts at 0 every
    // time a fresh List command dispatches, and advances as matching
    // entries stream out one after another within that one session.
    list_cursor: u16,
}

impl<D: FlashDevice> HostLink<D> {
    pub fn new(fs: SimpleFs<D>) -> Self {
        HostLink {
            fs,
            state: State::Idle,
            command: None,
            aux: [0u8; NAME_SIZE],
            aux_len: 0,
            page: [0u8; PAGE_SIZE],
            page_pos: 0,
            remaining: 0,
            list_cursor: 0,
        }
    }

    pub fn into_fs(self) -> SimpleFs<D> {
        self.fs
    }

    #[cfg(test)]
    fn fs_mut(&mut self) -> &mut SimpleFs<D> {
        &mut self.fs
    }

    fn reset(&mut self) {
        self.state = State::Idle;
        self.command = None;
        self.aux_len = 0;
        self.page_pos = 0;
        self.remaining = 0;
        self.list_cursor = 0;
    }

    /// Feed one assembled byte from the host into the session and return
    /// the byte the controller places on the bus in response. This is the
    /// entire session protocol: every transition the original ISR and main
    /// loop together performed happens inside this one call.
    pub fn on_host_byte(&mut self, byte: u8) -> u8 {
        match self.state {
            State::Idle => self.on_idle(byte),
            State::ReceiveCmd => self.on_receive_cmd(byte),
            State::ReceiveData => self.on_receive_data(byte),
            State::SendData => self.on_send_data(byte),
            State::Finish => self.on_finish(byte),
        }
    }

    fn on_idle(&mut self, byte: u8) -> u8 {
        let Some(cmd) = Command::from_u8(byte) else {
            return marker::NACK;
        };
        self.command = Some(cmd);
        self.aux_len = 0;
        if cmd == Command::Reset {
            self.reset();
            marker::ACK
        } else {
            self.state = State::ReceiveCmd;
            marker::ACK
        }
    }

    fn on_receive_cmd(&mut self, byte: u8) -> u8 {
        if byte == marker::EODT {
            return self.dispatch();
        }
        if self.aux_len >= NAME_SIZE {
            return marker::NACK;
        }
        self.aux[self.aux_len] = byte;
        self.aux_len += 1;
        marker::ACK
    }

    /// Runs the command staged in `self.command` / `self.aux` against the
    /// filesystem and arranges the next state.
    fn dispatch(&mut self) -> u8 {
        match self.command {
            Some(Command::List) => self.dispatch_list(),
            Some(Command::Read) => self.dispatch_read(),
            Some(Command::Write) => self.dispatch_write(),
            Some(Command::Delete) => self.dispatch_delete(),
            _ => {
                self.reset();
                marker::NACK
            }
        }
    }

    /// `LIST`'s scan restarts at block 0 for every fresh command; `list_cursor`
    /// only advances *within* one `SendData` session as entries stream out,
    /// matching `handle_cmd_list`'s `block = 0` on `initial`, `block++`
    /// otherwise.
    fn next_list_entry(&mut self) -> Option<(u16, FileEntry)> {
        let prefix = self.aux[..self.aux_len].to_vec();
        self.fs.list(self.list_cursor, Some(&prefix)).ok()
    }

    fn dispatch_list(&mut self) -> u8 {
        self.list_cursor = 0;
        match self.next_list_entry() {
            Some((block, entry)) => {
                self.page[..ENTRY_SIZE].copy_from_slice(&entry.to_bytes());
                self.page_pos = 0;
                self.remaining = ENTRY_SIZE as u32;
                self.list_cursor = block + 1;
                self.state = State::SendData;
                marker::BODT
            }
            None => {
                self.reset();
                marker::EODT
            }
        }
    }

    fn dispatch_read(&mut self) -> u8 {
        let spec = &self.aux[..self.aux_len];
        let result = if spec.first() == Some(&b'#') {
            parse_u16(&spec[1..]).ok_or(crate::fs::FsStatus::InvalidData)
                .and_then(|block| self.fs.read_by_block(block))
        } else {
            self.fs.read_by_name(spec)
        };
        match result {
            Ok((size, page)) => {
                self.page = page;
                self.page_pos = 0;
                self.remaining = size as u32;
                self.state = State::SendData;
                marker::BODT
            }
            Err(_) => {
                self.reset();
                marker::EODT
            }
        }
    }

    fn dispatch_delete(&mut self) -> u8 {
        let spec = &self.aux[..self.aux_len];
        let result = if spec.first() == Some(&b'#') {
            parse_u16(&spec[1..]).ok_or(crate::fs::FsStatus::InvalidData)
                .and_then(|block| self.fs.delete_by_block(block))
        } else {
            self.fs.delete_by_name(spec)
        };
        self.reset();
        if result.is_ok() {
            marker::ACK
        } else {
            marker::NACK
        }
    }

    fn dispatch_write(&mut self) -> u8 {
        let Some((name, start, stop)) = parse_write_spec(&self.aux[..self.aux_len]) else {
            self.reset();
            return marker::NACK;
        };
        match self.fs.create_entry(0, name, start, stop) {
            Ok((_block, total_size, page)) => {
                self.page = page;
                self.page_pos = ENTRY_SIZE;
                self.remaining = total_size as u32 - ENTRY_SIZE as u32;
                self.state = State::ReceiveData;
                marker::ACK
            }
            Err(_) => {
                self.reset();
                marker::NACK
            }
        }
    }

    fn on_receive_data(&mut self, byte: u8) -> u8 {
        if byte == marker::EODT {
            // The host closes a WRITE with EODT whether or not it has sent
            // every declared payload byte -- a zero-length file's lone
            // header page, and any early termination, both flush here
            // rather than on the byte counter.
            if self.page_pos > 0 && self.fs.write_file(&self.page).is_err() {
                self.reset();
                return marker::NACK;
            }
            self.state = State::Finish;
            return marker::ACK;
        }
        if self.remaining == 0 {
            // Every declared payload byte already landed; anything besides
            // EODT here is noise the host shouldn't be sending.
            return marker::ACK;
        }
        self.page[self.page_pos] = byte;
        self.page_pos += 1;
        self.remaining -= 1;
        if self.page_pos == PAGE_SIZE {
            if self.fs.write_file(&self.page).is_err() {
                self.reset();
                return marker::NACK;
            }
            self.page = [0xFFu8; PAGE_SIZE];
            self.page_pos = 0;
        }
        marker::ACK
    }

    fn on_send_data(&mut self, byte: u8) -> u8 {
        // The host drives this phase with ACK ("send more") or NACK
        // ("stop"); any other byte is ignored as noise on the link.
        if byte == marker::NACK {
            self.reset();
            return 0x00;
        }
        if byte != marker::ACK {
            return flags::BSY;
        }
        match self.command {
            Some(Command::List) => self.advance_list(),
            _ => self.advance_read(),
        }
    }

    /// `LIST`'s `remaining` tracks bytes left in the *current* entry; when it
    /// hits zero the entry is fully sent and the next matching one (if any)
    /// is fetched and streamed immediately, with no new `BODT` in between.
    fn advance_list(&mut self) -> u8 {
        if self.remaining == 0 {
            match self.next_list_entry() {
                Some((block, entry)) => {
                    self.page[..ENTRY_SIZE].copy_from_slice(&entry.to_bytes());
                    self.page_pos = 0;
                    self.remaining = ENTRY_SIZE as u32;
                    self.list_cursor = block + 1;
                }
                None => {
                    self.state = State::Finish;
                    return marker::EODT;
                }
            }
        }
        self.take_page_byte()
    }

    /// `READ`'s `remaining` tracks bytes left in the whole file; a drained
    /// page short of that total fetches the next one, matching
    /// `handle_cmd_read(false)`.
    fn advance_read(&mut self) -> u8 {
        if self.remaining == 0 {
            self.state = State::Finish;
            return marker::EODT;
        }
        if self.page_pos == PAGE_SIZE {
            match self.fs.read_next_page() {
                Ok(page) => {
                    self.page = page;
                    self.page_pos = 0;
                }
                Err(_) => {
                    self.state = State::Finish;
                    return marker::EODT;
                }
            }
        }
        self.take_page_byte()
    }

    fn take_page_byte(&mut self) -> u8 {
        let out = self.page[self.page_pos];
        self.page_pos += 1;
        self.remaining -= 1;
        out
    }

    /// The closing handshake after a transfer's `EODT`: one more host byte,
    /// answered with a plain "idle, nothing ready" byte rather than a marker.
    fn on_finish(&mut self, byte: u8) -> u8 {
        if byte == marker::ACK || byte == marker::NACK {
            self.reset();
            0x00
        } else {
            flags::BSY
        }
    }
}

/// Parses `"name#start#stop"` the way `parseWriteFileInput` does: name is
/// whatever precedes the first `#`, truncated to fit; `start`/`stop` are
/// hexadecimal.
fn parse_write_spec(spec: &[u8]) -> Option<(&[u8], u16, u16)> {
    let hash = spec.iter().position(|&b| b == b'#')?;
    let name = &spec[..hash.min(NAME_SIZE)];
    let rest = &spec[hash + 1..];
    let second_hash = rest.iter().position(|&b| b == b'#')?;
    let start = parse_hex_u16(&rest[..second_hash])?;
    let stop = parse_hex_u16(&rest[second_hash + 1..])?;
    Some((name, start, stop))
}

fn parse_hex_u16(digits: &[u8]) -> Option<u16> {
    let s = std::str::from_utf8(digits).ok()?;
    u16::from_str_radix(s, 16).ok()
}

fn parse_u16(digits: &[u8]) -> Option<u16> {
    let s = std::str::from_utf8(digits).ok()?;
    s.parse().ok()
}

/// Decodes a 32-byte page buffer into a [`FileEntry`], used by callers on
/// the host side that receive a List response over the link.
pub fn decode_list_entry(page: &[u8]) -> FileEntry {
    FileEntry::from_bytes(&page[..ENTRY_SIZE])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::ImageFile;

    fn fresh_link(blocks: u16) -> HostLink<ImageFile> {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let image = ImageFile::open(tmp.path()).unwrap();
        let mut fs = SimpleFs::new(image);
        fs.init(blocks).unwrap();
        HostLink::new(fs)
    }

    fn send_bytes(link: &mut HostLink<ImageFile>, bytes: &[u8]) -> Vec<u8> {
        bytes.iter().map(|&b| link.on_host_byte(b)).collect()
    }

    #[test]
    fn write_then_read_round_trips_over_the_link() {
        let mut link = fresh_link(2);
        let mut session = vec![Command::Write as u8];
        session.extend_from_slice(b"hi#0#5");
        session.push(marker::EODT);
        session.extend_from_slice(b"world");
        session.push(marker::EODT);
        let responses = send_bytes(&mut link, &session);
        assert!(responses.iter().all(|&b| b == marker::ACK));
        // The write session's own closing handshake drops the link back to
        // idle before the read session below opens.
        assert_eq!(link.on_host_byte(marker::ACK), 0x00);

        let mut session = vec![Command::Read as u8];
        session.extend_from_slice(b"hi");
        session.push(marker::EODT);
        let mut out = Vec::new();
        let responses = send_bytes(&mut link, &session);
        assert_eq!(*responses.last().unwrap(), marker::BODT);
        loop {
            let b = link.on_host_byte(marker::ACK);
            if b == marker::EODT {
                break;
            }
            out.push(b);
        }
        assert_eq!(&out[ENTRY_SIZE..], b"world");
        // The closing handshake after EODT drops the link back to idle.
        assert_eq!(link.on_host_byte(marker::ACK), 0x00);
        assert_eq!(link.on_host_byte(Command::Reset as u8), marker::ACK);
    }

    /// A WRITE's page flush is gated on the host's closing `EODT`, not on
    /// the declared byte count alone: once all five payload bytes have
    /// landed the file is still unwritten on the device until `EODT`
    /// arrives, matching `handle_cmd_write`'s `case EODT:` finalize branch
    /// (spec.md's `RECEIVE_DATA / EODT -> FINISH` transition).
    #[test]
    fn write_flushes_only_on_eodt_not_on_byte_count() {
        let mut link = fresh_link(2);
        let mut session = vec![Command::Write as u8];
        session.extend_from_slice(b"hi#0#5");
        session.push(marker::EODT);
        session.extend_from_slice(b"world");
        let responses = send_bytes(&mut link, &session);
        assert!(responses.iter().all(|&b| b == marker::ACK));

        // All five declared payload bytes have been accepted, but the page
        // is still only staged in memory -- the device's block is untouched.
        assert_eq!(
            link.fs_mut().read_by_name(b"hi"),
            Err(crate::fs::FsStatus::FileEntryNotFound)
        );

        // The closing EODT is what actually flushes the page.
        assert_eq!(link.on_host_byte(marker::EODT), marker::ACK);
        let (size, page) = link.fs_mut().read_by_name(b"hi").unwrap();
        assert_eq!(size as usize, ENTRY_SIZE + 5);
        assert_eq!(&page[ENTRY_SIZE..ENTRY_SIZE + 5], b"world");

        // The write session's own closing handshake drops the link back to
        // idle, matching the round-trip test above.
        assert_eq!(link.on_host_byte(marker::ACK), 0x00);
        assert_eq!(link.on_host_byte(Command::Reset as u8), marker::ACK);
    }

    /// A host that terminates a WRITE early with `EODT`, before sending
    /// every declared payload byte, still gets its partial page flushed --
    /// the original's early-termination behavior this state exists to
    /// preserve, rather than leaving the partially-filled scratch page
    /// silently discarded.
    #[test]
    fn write_eodt_flushes_partial_page_on_early_termination() {
        let mut link = fresh_link(2);
        let mut session = vec![Command::Write as u8];
        session.extend_from_slice(b"hi#0#5");
        session.push(marker::EODT);
        // Only 2 of the 5 declared payload bytes are actually sent.
        session.extend_from_slice(b"wo");
        session.push(marker::EODT);
        let responses = send_bytes(&mut link, &session);
        assert!(responses.iter().all(|&b| b == marker::ACK));

        let (size, page) = link.fs_mut().read_by_name(b"hi").unwrap();
        // The header still declares the full 5-byte size the spec promised;
        // only the bytes actually transferred made it into the page.
        assert_eq!(size as usize, ENTRY_SIZE + 5);
        assert_eq!(&page[ENTRY_SIZE..ENTRY_SIZE + 2], b"wo");

        // The write session's own closing handshake drops the link back to
        // idle, same as a fully-delivered write.
        assert_eq!(link.on_host_byte(marker::ACK), 0x00);
        assert_eq!(link.on_host_byte(Command::Reset as u8), marker::ACK);
    }

    #[test]
    fn unknown_command_byte_is_nacked() {
        let mut link = fresh_link(1);
        assert_eq!(link.on_host_byte(0x7F), marker::NACK);
    }

    proptest::proptest! {
        /// A byte built with `DAT` set and an arbitrary low nibble is never
        /// equal to any of the four fixed markers, which all have `DAT`
        /// clear by construction.
        #[test]
        fn data_byte_never_collides_with_a_marker(nibble in 0u8..16) {
            let data_byte = flags::DAT | nibble;
            proptest::prop_assert_ne!(data_byte, marker::BODT);
            proptest::prop_assert_ne!(data_byte, marker::EODT);
            proptest::prop_assert_ne!(data_byte, marker::ACK);
            proptest::prop_assert_ne!(data_byte, marker::NACK);
        }
    }

    #[test]
    fn read_missing_file_closes_with_eodt_and_returns_to_idle() {
        let mut link = fresh_link(1);
        let mut session = vec![Command::Read as u8];
        session.extend_from_slice(b"ghost");
        session.push(marker::EODT);
        let responses = send_bytes(&mut link, &session);
        assert_eq!(*responses.last().unwrap(), marker::EODT);
        // An empty/failed LIST or READ drops straight to idle -- there is no
        // SendData session to close, so the very next byte is a fresh command.
        assert_eq!(link.on_host_byte(Command::Reset as u8), marker::ACK);
    }

    /// LIST streams every matching entry within a single command/session,
    /// terminated once by `EODT` -- it does not require the host to reissue
    /// `LIST` per entry.
    #[test]
    fn list_streams_every_matching_entry_in_one_session() {
        let mut link = fresh_link(4);
        for (name, spec) in [("aaa", "0#1"), ("abb", "0#1"), ("zzz", "0#1")] {
            let mut session = vec![Command::Write as u8];
            session.extend_from_slice(format!("{name}#{spec}").as_bytes());
            session.push(marker::EODT);
            session.push(b'x');
            send_bytes(&mut link, &session);
        }

        let mut session = vec![Command::List as u8];
        session.push(b'a');
        session.push(marker::EODT);
        let responses = send_bytes(&mut link, &session);
        assert_eq!(*responses.last().unwrap(), marker::BODT);

        let mut seen = Vec::new();
        let mut entry_bytes = Vec::with_capacity(ENTRY_SIZE);
        loop {
            let b = link.on_host_byte(marker::ACK);
            if b == marker::EODT {
                break;
            }
            entry_bytes.push(b);
            if entry_bytes.len() == ENTRY_SIZE {
                seen.push(decode_list_entry(&entry_bytes).name_str().to_string());
                entry_bytes.clear();
            }
        }
        assert_eq!(seen, vec!["aaa", "abb"]);
        // The closing handshake after EODT drops the link back to idle.
        assert_eq!(link.on_host_byte(marker::ACK), 0x00);
    }
}
