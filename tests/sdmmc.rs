use std::collections::VecDeque;

use spi_sdmmc::{
    BlockDevice, CardType, Clock, Config, Instant, Operation, Partial, SdMmcError, SpiBus,
    SpiDevice, SpiSdMmcCard,
};

fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ScriptError;

/// An SPI device whose card-side bytes are scripted in advance.
///
/// Bytes written by the driver are recorded; bytes read by the driver are
/// popped from the script, with `0xFF` (an idle bus) once the script runs
/// out. Write and skip legs do not consume script bytes, which keeps the
/// scripts readable.
struct ScriptedDevice {
    responses: VecDeque<u8>,
    written: Vec<u8>,
    clocks: Vec<u32>,
    selected: bool,
    selects: u32,
    open_count: u32,
    locks: u32,
    executes: usize,
    block_writes: u32,
    fail_at_block_write: Option<u32>,
}

impl ScriptedDevice {
    fn new(responses: &[u8]) -> ScriptedDevice {
        ScriptedDevice {
            responses: responses.iter().copied().collect(),
            written: Vec::new(),
            clocks: Vec::new(),
            selected: false,
            selects: 0,
            open_count: 0,
            locks: 0,
            executes: 0,
            block_writes: 0,
            fail_at_block_write: None,
        }
    }
}

impl SpiBus for ScriptedDevice {
    type Error = ScriptError;

    fn configure(&mut self, config: &Config) -> Result<(), Self::Error> {
        self.clocks.push(config.clock_hz);
        Ok(())
    }

    fn execute(&mut self, operations: &mut [Operation<'_>]) -> Result<(), Self::Error> {
        self.executes += 1;

        // A data block write starts with the two-byte lead-in + token leg.
        if let Some(first) = operations.first() {
            if let Some(write) = first.write_buffer() {
                if write.len() == 2 && (write[1] == 0xFE || write[1] == 0xFC) {
                    self.block_writes += 1;
                    if self.fail_at_block_write == Some(self.block_writes) {
                        return Err(ScriptError);
                    }
                }
            }
        }

        for operation in operations.iter_mut() {
            let length = operation.len();
            if let Some(write) = operation.write_buffer() {
                self.written.extend_from_slice(write);
            }
            if let Some(read) = operation.read_buffer() {
                for byte in read.iter_mut() {
                    *byte = self.responses.pop_front().unwrap_or(0xFF);
                }
            }
            operation.record_transferred(length);
        }
        Ok(())
    }

    fn select(&mut self) -> Result<(), Self::Error> {
        self.selected = true;
        self.selects += 1;
        Ok(())
    }

    fn deselect(&mut self) -> Result<(), Self::Error> {
        self.selected = false;
        Ok(())
    }
}

impl SpiDevice for ScriptedDevice {
    fn open(&mut self) -> Result<u32, Self::Error> {
        self.open_count += 1;
        Ok(self.open_count)
    }

    fn close(&mut self) -> Result<u32, Self::Error> {
        self.open_count -= 1;
        Ok(self.open_count)
    }

    fn lock(&mut self) -> Result<(), Self::Error> {
        self.locks += 1;
        Ok(())
    }

    fn unlock(&mut self) -> Result<(), Self::Error> {
        self.locks -= 1;
        Ok(())
    }
}

/// Monotonic clock advancing a fixed step on every reading.
struct FakeClock {
    now_ms: u64,
    step_ms: u64,
}

impl FakeClock {
    fn new() -> FakeClock {
        FakeClock {
            now_ms: 0,
            step_ms: 1,
        }
    }

    fn with_step(step_ms: u64) -> FakeClock {
        FakeClock { now_ms: 0, step_ms }
    }
}

impl Clock for FakeClock {
    fn now(&mut self) -> Instant {
        let now = self.now_ms;
        self.now_ms += self.step_ms;
        Instant::from_ticks(now)
    }
}

// ============================================================================

const OPERATING_CLOCK: u32 = 25_000_000;

fn frame(command: u8, argument: u32, crc7: u8) -> [u8; 6] {
    [
        0x40 | command,
        (argument >> 24) as u8,
        (argument >> 16) as u8,
        (argument >> 8) as u8,
        argument as u8,
        crc7 << 1 | 1,
    ]
}

fn count_frames(written: &[u8], frame: &[u8; 6]) -> usize {
    written
        .windows(6)
        .filter(|window| *window == &frame[..])
        .count()
}

fn contains_frame(written: &[u8], frame: &[u8; 6]) -> bool {
    count_frames(written, frame) > 0
}

/// Card-side bytes of an SD v2 negotiation that reaches ready on the first
/// ACMD41 attempt.
fn sd_v2_handshake(ocr: [u8; 4]) -> Vec<u8> {
    let mut responses = Vec::new();
    responses.push(0x01); // CMD0: idle
    responses.extend_from_slice(&[0x01, 0x00, 0x00, 0x01, 0xAA]); // CMD8: idle, pattern echoed
    responses.push(0x01); // CMD55: idle
    responses.push(0x00); // ACMD41: ready
    responses.push(0x00); // CMD58: ready
    responses.extend_from_slice(&ocr);
    responses
}

/// Card-side bytes of a CSD register read: R1, start token and a version 2
/// CSD with C_SIZE 4095 (a 2 GiB card). The two CRC bytes are skipped by
/// the driver, not read, so they do not appear here.
fn csd_read() -> Vec<u8> {
    let mut responses = vec![0x00, 0xFE];
    let mut csd = [0u8; 16];
    csd[0] = 0x40; // CSD_STRUCTURE: version 2.0
    csd[8] = 0x0F;
    csd[9] = 0xFF;
    responses.extend_from_slice(&csd);
    responses
}

/// Opens a 2 GiB block-addressed SD v2 card against the given script tail.
fn open_sd_v2(tail: &[u8]) -> (ScriptedDevice, FakeClock) {
    let mut responses = sd_v2_handshake([0xC0, 0xFF, 0x80, 0x00]);
    responses.extend_from_slice(&csd_read());
    responses.extend_from_slice(tail);
    (ScriptedDevice::new(&responses), FakeClock::new())
}

// ============================================================================

#[test]
fn negotiates_sd_v2_with_block_addressing() {
    init_log();
    let (mut script, clock) = open_sd_v2(&[]);
    {
        let mut card = SpiSdMmcCard::new(&mut script, clock, OPERATING_CLOCK);
        card.open().unwrap();
        assert_eq!(card.card_type(), Some(CardType::SdV2));
        assert_eq!(card.block_size(), 512);
        assert_eq!(card.size(), 2 * 1024 * 1024 * 1024);
        card.close().unwrap();
        assert_eq!(card.card_type(), None);
    }

    // Slow clock for negotiation, operating clock afterwards.
    assert_eq!(script.clocks, vec![400_000, OPERATING_CLOCK]);
    assert_eq!(script.open_count, 0);
    // One session covered the whole handshake, released on the way out.
    assert_eq!(script.selects, 1);
    assert!(!script.selected);

    assert!(contains_frame(&script.written, &frame(0x00, 0, 0x4A)));
    assert!(contains_frame(&script.written, &frame(0x08, 0x1AA, 0x43)));
    // HCS set, because CMD8 marked the card as version 2.
    assert!(contains_frame(&script.written, &frame(0x29, 0x4000_0000, 0)));
    // Block addressed cards never get SET_BLOCKLEN.
    assert!(!contains_frame(&script.written, &frame(0x10, 512, 0)));
}

#[test]
fn negotiates_mmc_via_legacy_path() {
    init_log();
    let mut responses = vec![0x01]; // CMD0: idle
    responses.extend_from_slice(&[0x05, 0xFF, 0xFF, 0xFF, 0xFF]); // CMD8: illegal command
    responses.push(0x01); // CMD55: idle
    responses.push(0x05); // ACMD41: illegal command, fall through
    responses.push(0x00); // CMD1: ready
    responses.push(0x00); // CMD16: block length accepted
    responses.extend_from_slice(&csd_read());
    // One block read from byte address 512.
    responses.push(0x00); // CMD17
    responses.push(0xFE); // start token
    responses.extend_from_slice(&[0x5A; 512]);

    let mut script = ScriptedDevice::new(&responses);
    {
        let mut card = SpiSdMmcCard::new(&mut script, FakeClock::new(), OPERATING_CLOCK);
        card.open().unwrap();
        assert_eq!(card.card_type(), Some(CardType::Mmc));

        let mut buffer = [0u8; 512];
        card.read(512, &mut buffer).unwrap();
        assert!(buffer.iter().all(|&byte| byte == 0x5A));
    }

    assert!(contains_frame(&script.written, &frame(0x01, 0, 0)));
    // Byte addressed: SET_BLOCKLEN is sent and the read argument is the
    // byte offset, not the block index.
    assert!(contains_frame(&script.written, &frame(0x10, 512, 0)));
    assert!(contains_frame(&script.written, &frame(0x11, 512, 0)));
}

#[test]
fn sd_v2_acmd41_timeout_fails() {
    let mut responses = vec![0x01];
    responses.extend_from_slice(&[0x01, 0x00, 0x00, 0x01, 0xAA]);
    for _ in 0..10 {
        responses.push(0x01); // CMD55: idle
        responses.push(0x01); // ACMD41: still idle
    }

    let mut script = ScriptedDevice::new(&responses);
    {
        let mut card =
            SpiSdMmcCard::new(&mut script, FakeClock::with_step(300), OPERATING_CLOCK);
        assert_eq!(card.open(), Err(SdMmcError::Timeout));
        assert_eq!(card.card_type(), None);
    }

    // The failed negotiation released the open reference again.
    assert_eq!(script.open_count, 0);
    assert!(!script.selected);
}

#[test]
fn open_times_out_on_unresponsive_bus() {
    let mut script = ScriptedDevice::new(&[]);
    {
        let mut card = SpiSdMmcCard::new(&mut script, FakeClock::new(), OPERATING_CLOCK);
        assert_eq!(card.open(), Err(SdMmcError::Timeout));
    }
    assert_eq!(script.open_count, 0);
    assert!(!script.selected);
}

#[test]
fn rejects_unsupported_voltage_range() {
    let mut responses = vec![0x01];
    // Idle, but the check pattern comes back mangled.
    responses.extend_from_slice(&[0x01, 0x00, 0x00, 0x02, 0xAA]);

    let mut script = ScriptedDevice::new(&responses);
    let mut card = SpiSdMmcCard::new(&mut script, FakeClock::new(), OPERATING_CLOCK);
    assert_eq!(card.open(), Err(SdMmcError::Protocol));
}

#[test]
fn rejects_cmd55_failure() {
    let mut responses = vec![0x01];
    responses.extend_from_slice(&[0x01, 0x00, 0x00, 0x01, 0xAA]);
    responses.push(0x04); // CMD55: illegal command without idle

    let mut script = ScriptedDevice::new(&responses);
    let mut card = SpiSdMmcCard::new(&mut script, FakeClock::new(), OPERATING_CLOCK);
    assert_eq!(card.open(), Err(SdMmcError::Protocol));
}

#[test]
fn rejects_unsupported_csd_structure() {
    let mut responses = sd_v2_handshake([0xC0, 0xFF, 0x80, 0x00]);
    responses.push(0x00); // CMD9
    responses.push(0xFE); // start token
    responses.extend_from_slice(&[0u8; 16]); // CSD_STRUCTURE == 0
    // A second, intact handshake for the retry.
    responses.extend_from_slice(&sd_v2_handshake([0xC0, 0xFF, 0x80, 0x00]));
    responses.extend_from_slice(&csd_read());

    let mut script = ScriptedDevice::new(&responses);
    {
        let mut card = SpiSdMmcCard::new(&mut script, FakeClock::new(), OPERATING_CLOCK);
        assert_eq!(card.open(), Err(SdMmcError::Protocol));
        assert_eq!(card.card_type(), None);

        // Still closed: block I/O is refused outright.
        let mut buffer = [0u8; 512];
        assert_eq!(
            card.read(0, &mut buffer),
            Err(Partial::from(SdMmcError::NotReady))
        );

        // The failed open released the reference, so a later open runs the
        // whole negotiation again.
        card.open().unwrap();
        assert_eq!(card.card_type(), Some(CardType::SdV2));
        card.close().unwrap();
    }
    assert_eq!(script.open_count, 0);
}

/// Number of transactions a plain open-then-drop runs, used to prove that
/// rejected calls never reach the bus.
fn negotiation_execute_count() -> usize {
    let (mut script, clock) = open_sd_v2(&[]);
    {
        let mut card = SpiSdMmcCard::new(&mut script, clock, OPERATING_CLOCK);
        card.open().unwrap();
    }
    script.executes
}

#[test]
fn validates_alignment_and_bounds() {
    let expected_executes = negotiation_execute_count();

    let (mut script, clock) = open_sd_v2(&[]);
    let mut card = SpiSdMmcCard::new(&mut script, clock, OPERATING_CLOCK);
    card.open().unwrap();

    let mut buffer = [0u8; 1024];
    assert_eq!(
        card.read(100, &mut buffer[..512]),
        Err(Partial::from(SdMmcError::InvalidArgument))
    );
    assert_eq!(
        card.read(0, &mut buffer[..100]),
        Err(Partial::from(SdMmcError::InvalidArgument))
    );
    assert_eq!(
        card.program(512, &buffer[..100]),
        Err(Partial::from(SdMmcError::InvalidArgument))
    );
    assert_eq!(card.erase(0, 100), Err(SdMmcError::InvalidArgument));

    // Spanning past the last block of the 2 GiB card.
    let end = 2u64 * 1024 * 1024 * 1024;
    assert_eq!(
        card.read(end, &mut buffer[..512]),
        Err(Partial::from(SdMmcError::OutOfRange))
    );
    assert_eq!(
        card.program(end - 512, &buffer),
        Err(Partial::from(SdMmcError::OutOfRange))
    );
    assert_eq!(card.erase(end - 512, 1024), Err(SdMmcError::OutOfRange));

    // Zero-sized calls succeed without touching the card.
    card.read(0, &mut buffer[..0]).unwrap();
    card.program(0, &buffer[..0]).unwrap();
    card.erase(0, 0).unwrap();

    let (device, _) = card.release();
    assert_eq!(
        device.executes, expected_executes,
        "rejected calls must not reach the bus"
    );
}

#[test]
fn single_block_write_uses_single_token() {
    let mut tail = Vec::new();
    tail.push(0x00); // CMD24
    tail.extend_from_slice(&[0xFF, 0xFF, 0xE5]); // footer: data accepted
    tail.push(0xFF); // not busy

    let (mut script, clock) = open_sd_v2(&tail);
    {
        let mut card = SpiSdMmcCard::new(&mut script, clock, OPERATING_CLOCK);
        card.open().unwrap();
        let data = [0xA5u8; 512];
        card.program(3 * 512, &data).unwrap();
    }

    // Block addressed: block index 3, single-block command and token.
    assert!(contains_frame(&script.written, &frame(0x18, 3, 0)));
    assert!(script.written.windows(3).any(|w| w == [0xFF, 0xFE, 0xA5]));
    assert!(!script.written.contains(&0xFC));
    assert!(!script.written.contains(&0xFD));
}

#[test]
fn multi_block_write_reports_partial_failure() {
    let mut tail = Vec::new();
    tail.push(0x00); // CMD25
    for _ in 0..2 {
        tail.extend_from_slice(&[0xFF, 0xFF, 0xE5]); // footer: data accepted
        tail.push(0xFF); // not busy
    }

    let (mut script, clock) = open_sd_v2(&tail);
    script.fail_at_block_write = Some(3);
    {
        let mut card = SpiSdMmcCard::new(&mut script, clock, OPERATING_CLOCK);
        card.open().unwrap();

        let data = [0xA5u8; 4 * 512];
        assert_eq!(
            card.program(0, &data),
            Err(Partial::new(SdMmcError::Transport(ScriptError), 2 * 512))
        );
    }

    // Two blocks went out with the multi-block token, and the failed write
    // must not be followed by a stop token.
    assert_eq!(
        script
            .written
            .windows(2)
            .filter(|w| *w == [0xFF, 0xFC])
            .count(),
        2
    );
    assert!(!script.written.contains(&0xFD));
}

#[test]
fn multi_block_write_sends_stop_token() {
    let mut tail = Vec::new();
    tail.push(0x00); // CMD25
    for _ in 0..2 {
        tail.extend_from_slice(&[0xFF, 0xFF, 0xE5]);
        tail.push(0xFF);
    }
    tail.push(0xFF); // not busy after the stop token

    let (mut script, clock) = open_sd_v2(&tail);
    {
        let mut card = SpiSdMmcCard::new(&mut script, clock, OPERATING_CLOCK);
        card.open().unwrap();
        let data = [0xA5u8; 2 * 512];
        card.program(0, &data).unwrap();
    }

    assert!(contains_frame(&script.written, &frame(0x19, 0, 0)));
    assert!(script.written.contains(&0xFD));
}

#[test]
fn multi_block_read_sends_stop_transmission() {
    let mut tail = Vec::new();
    tail.push(0x00); // CMD18
    for _ in 0..2 {
        tail.push(0xFE); // start token
        tail.extend_from_slice(&[0x5A; 512]);
    }
    tail.push(0x00); // CMD12
    tail.push(0xFF); // not busy

    let (mut script, clock) = open_sd_v2(&tail);
    {
        let mut card = SpiSdMmcCard::new(&mut script, clock, OPERATING_CLOCK);
        card.open().unwrap();

        let mut buffer = [0u8; 2 * 512];
        card.read(0, &mut buffer).unwrap();
        assert!(buffer.iter().all(|&byte| byte == 0x5A));
    }

    assert!(contains_frame(&script.written, &frame(0x12, 0, 0)));
    assert!(contains_frame(&script.written, &frame(0x0C, 0, 0)));
}

#[test]
fn erase_issues_block_range() {
    let mut tail = Vec::new();
    tail.push(0x00); // CMD32
    tail.push(0x00); // CMD33
    tail.push(0x00); // CMD38
    tail.push(0xFF); // not busy

    let (mut script, clock) = open_sd_v2(&tail);
    {
        let mut card = SpiSdMmcCard::new(&mut script, clock, OPERATING_CLOCK);
        card.open().unwrap();
        card.erase(0, 2 * 512).unwrap();
    }

    assert!(contains_frame(&script.written, &frame(0x20, 0, 0)));
    assert!(contains_frame(&script.written, &frame(0x21, 1, 0)));
    assert!(contains_frame(&script.written, &frame(0x26, 0, 0)));
}

#[test]
fn double_open_negotiates_once() {
    let (mut script, clock) = open_sd_v2(&[]);
    {
        let mut card = SpiSdMmcCard::new(&mut script, clock, OPERATING_CLOCK);
        card.open().unwrap();
        card.open().unwrap();
        assert_eq!(card.card_type(), Some(CardType::SdV2));

        card.close().unwrap();
        // Still held once: the state survives.
        assert_eq!(card.card_type(), Some(CardType::SdV2));
        card.close().unwrap();
        assert_eq!(card.card_type(), None);
    }

    assert_eq!(count_frames(&script.written, &frame(0x00, 0, 0x4A)), 1);
    assert_eq!(script.open_count, 0);
}

#[test]
fn lock_unlock_and_noops() {
    let (mut script, clock) = open_sd_v2(&[]);
    {
        let mut card = SpiSdMmcCard::new(&mut script, clock, OPERATING_CLOCK);
        card.open().unwrap();

        card.lock().unwrap();
        card.lock().unwrap();
        card.unlock().unwrap();
        card.unlock().unwrap();

        card.synchronize().unwrap();
        card.trim(0, 512).unwrap();
        assert_eq!(card.erased_value(), Err(SdMmcError::Unsupported));
        assert_eq!(card.erase_block_size(), 512);
        assert_eq!(card.program_block_size(), 512);
        assert_eq!(card.read_block_size(), 512);
    }
    assert_eq!(script.locks, 0);
}

#[test]
fn response_reader_skips_leading_filler() {
    let mut responses = vec![0xFF, 0xFF, 0xFF, 0x01]; // CMD0 after three fillers
    responses.extend_from_slice(&[0x01, 0x00, 0x00, 0x01, 0xAA]);
    responses.push(0x01);
    responses.push(0x00);
    responses.push(0x00);
    responses.extend_from_slice(&[0xC0, 0xFF, 0x80, 0x00]);
    responses.extend_from_slice(&csd_read());

    let mut script = ScriptedDevice::new(&responses);
    let mut card = SpiSdMmcCard::new(&mut script, FakeClock::new(), OPERATING_CLOCK);
    card.open().unwrap();
    assert_eq!(card.card_type(), Some(CardType::SdV2));
}
