//! Emulator Driver (spec.md §4.1).
//!
//! REDESIGN FLAG #1: a typed trait with concrete methods, backed by one
//! adapter ([`QemuRspDriver`]) that speaks the GDB Remote Serial Protocol
//! directly over the emulator's stdio pipe. No debugger script is ever
//! generated.

pub mod process;
pub mod rsp;

use std::net::UdpSocket;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tracing::instrument;

use crate::error::{GqfiError, Result};
use process::{EmulatorProcess, StartParams};
use rsp::RspTransport;

/// Outcome of [`EmulatorDriver::run_until`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HitSymbol {
    Symbol(String),
    Disconnected,
}

/// The Emulator Driver contract, spec.md §4.1. One instance exclusively
/// owns one emulator child process and its debug connection.
#[async_trait]
pub trait EmulatorDriver: Send {
    async fn start(&mut self, image32: &Path, disk: &Path, serial_sink_port: u16) -> Result<()>;
    async fn run_until(&mut self, symbols: &[&str]) -> Result<HitSymbol>;
    async fn save_snapshot(&mut self, tag: &str) -> Result<()>;
    async fn load_snapshot(&mut self, tag: &str, entry_symbol: &str) -> Result<()>;
    async fn write_msr(&mut self, index: u32, value: u64) -> Result<()>;
    async fn read_msr(&mut self, index: u32) -> Result<u64>;
    async fn read_byte(&mut self, addr: u64) -> Result<u8>;
    async fn write_byte(&mut self, addr: u64, value: u8) -> Result<()>;
    async fn set_hw_breakpoint(&mut self, addr: u64) -> Result<()>;
    async fn clear_breakpoints(&mut self) -> Result<()>;
    async fn set_write_watchpoint(&mut self, addr: u64) -> Result<()>;
    async fn clear_watchpoints(&mut self) -> Result<()>;
    async fn step_one(&mut self) -> Result<()>;
    async fn quit(&mut self) -> Result<()>;

    /// Unique tag assigned at `start`, used for log correlation (kill is
    /// always by held process handle, never by tag pattern matching).
    fn tag(&self) -> Option<&str>;
    fn pid(&self) -> Option<u32>;
}

/// Resolves a symbol name to an address. In this design the map is built
/// once by the Analyzer from the target's symbol table and handed to every
/// subsequent driver operation; it is intentionally not the driver's job to
/// parse ELF symbol tables.
pub trait SymbolTable: Send + Sync {
    fn resolve(&self, symbol: &str) -> Option<u64>;
}

pub struct QemuRspDriver<S: SymbolTable> {
    process: Option<EmulatorProcess>,
    symbols: S,
    breakpoints: Vec<u64>,
    watchpoints: Vec<u64>,
}

impl<S: SymbolTable> QemuRspDriver<S> {
    pub fn new(symbols: S) -> Self {
        Self {
            process: None,
            symbols,
            breakpoints: Vec::new(),
            watchpoints: Vec::new(),
        }
    }

    fn process_mut(&mut self) -> Result<&mut EmulatorProcess> {
        self.process
            .as_mut()
            .ok_or_else(|| GqfiError::Emulator("driver not started".into()))
    }

    fn resolve(&self, symbol: &str) -> Result<u64> {
        self.symbols
            .resolve(symbol)
            .ok_or_else(|| GqfiError::Emulator(format!("unresolved symbol: {symbol}")))
    }

    async fn transport(&mut self) -> Result<RspTransport<&mut tokio::process::ChildStdin, &mut tokio::io::BufReader<tokio::process::ChildStdout>>> {
        let proc = self.process_mut()?;
        Ok(RspTransport::new(&mut proc.stdin, &mut proc.stdout))
    }

    /// Encode a little-endian hex write payload for the `M addr,len:data`
    /// RSP memory-write command.
    fn hex_byte(value: u8) -> String {
        format!("{value:02x}")
    }
}

#[async_trait]
impl<S: SymbolTable + 'static> EmulatorDriver for QemuRspDriver<S> {
    #[instrument(skip(self), fields(tag = tracing::field::Empty))]
    async fn start(&mut self, image32: &Path, disk: &Path, serial_sink_port: u16) -> Result<()> {
        let params = StartParams {
            image32,
            disk,
            serial_sink_port,
            ram_mb: 8,
        };
        let process = process::spawn(&params)?;
        tracing::Span::current().record("tag", process.tag.as_str());
        self.process = Some(process);
        // The debug stub is attached before the first instruction retires
        // because qemu was launched with `-S`; nothing to acknowledge yet.
        Ok(())
    }

    async fn run_until(&mut self, symbols: &[&str]) -> Result<HitSymbol> {
        let mut addrs = Vec::with_capacity(symbols.len());
        for s in symbols {
            addrs.push((*s, self.resolve(s)?));
        }
        for (_, addr) in &addrs {
            self.set_hw_breakpoint(*addr).await?;
        }
        let mut transport = self.transport().await?;
        let resp = transport.request("c").await;
        drop(transport);
        let resp = match resp {
            Ok(r) => r,
            Err(_) => return Ok(HitSymbol::Disconnected),
        };
        // `T05thread:...;bkpt_addr:<hex>;` is the stop-reply shape used by
        // this adapter; the breakpoint address tells us which symbol hit.
        let hit_addr = parse_stop_reply_addr(&resp)?;
        for (name, addr) in &addrs {
            if *addr == hit_addr {
                return Ok(HitSymbol::Symbol(name.to_string()));
            }
        }
        Err(GqfiError::Emulator(format!(
            "halted at unexpected address {hit_addr:#x}"
        )))
    }

    async fn save_snapshot(&mut self, tag: &str) -> Result<()> {
        let mut transport = self.transport().await?;
        transport
            .request(&format!("qRcmd,{}", hex_encode(&format!("savevm {tag}"))))
            .await?;
        Ok(())
    }

    async fn load_snapshot(&mut self, tag: &str, entry_symbol: &str) -> Result<()> {
        {
            let mut transport = self.transport().await?;
            transport
                .request(&format!("qRcmd,{}", hex_encode(&format!("loadvm {tag}"))))
                .await?;
        }
        // After loadvm the debugger's PC cache is stale (spec.md §4.1): set
        // a one-shot breakpoint at the entry symbol and resume into it.
        self.clear_breakpoints().await?;
        let entry = self.resolve(entry_symbol)?;
        self.set_hw_breakpoint(entry).await?;
        let mut transport = self.transport().await?;
        transport.request("c").await?;
        Ok(())
    }

    async fn write_msr(&mut self, index: u32, value: u64) -> Result<()> {
        let mut transport = self.transport().await?;
        transport
            .request(&format!(
                "qRcmd,{}",
                hex_encode(&format!("wrmsr {index:#x} {value:#x}"))
            ))
            .await?;
        Ok(())
    }

    async fn read_msr(&mut self, index: u32) -> Result<u64> {
        let mut transport = self.transport().await?;
        let resp = transport
            .request(&format!("qRcmd,{}", hex_encode(&format!("rdmsr {index:#x}"))))
            .await?;
        u64::from_str_radix(resp.trim_start_matches("0x"), 16)
            .map_err(|_| GqfiError::Emulator(format!("malformed rdmsr reply: {resp}")))
    }

    async fn read_byte(&mut self, addr: u64) -> Result<u8> {
        let mut transport = self.transport().await?;
        let resp = transport.request(&format!("m{addr:x},1")).await?;
        u8::from_str_radix(&resp, 16)
            .map_err(|_| GqfiError::Emulator(format!("malformed memory read reply: {resp}")))
    }

    async fn write_byte(&mut self, addr: u64, value: u8) -> Result<()> {
        let mut transport = self.transport().await?;
        transport
            .request(&format!("M{addr:x},1:{}", Self::hex_byte(value)))
            .await?;
        Ok(())
    }

    async fn set_hw_breakpoint(&mut self, addr: u64) -> Result<()> {
        if self.breakpoints.contains(&addr) {
            return Ok(());
        }
        let mut transport = self.transport().await?;
        transport.request(&format!("Z1,{addr:x},1")).await?;
        self.breakpoints.push(addr);
        Ok(())
    }

    async fn clear_breakpoints(&mut self) -> Result<()> {
        let addrs = std::mem::take(&mut self.breakpoints);
        let mut transport = self.transport().await?;
        for addr in addrs {
            transport.request(&format!("z1,{addr:x},1")).await?;
        }
        Ok(())
    }

    async fn set_write_watchpoint(&mut self, addr: u64) -> Result<()> {
        if self.watchpoints.contains(&addr) {
            return Ok(());
        }
        let mut transport = self.transport().await?;
        transport.request(&format!("Z2,{addr:x},1")).await?;
        self.watchpoints.push(addr);
        Ok(())
    }

    async fn clear_watchpoints(&mut self) -> Result<()> {
        let addrs = std::mem::take(&mut self.watchpoints);
        let mut transport = self.transport().await?;
        for addr in addrs {
            transport.request(&format!("z2,{addr:x},1")).await?;
        }
        Ok(())
    }

    async fn step_one(&mut self) -> Result<()> {
        let mut transport = self.transport().await?;
        transport.request("s").await?;
        Ok(())
    }

    async fn quit(&mut self) -> Result<()> {
        let tag = self.tag().map(|s| s.to_string());
        let quit_result = {
            let mut transport = self.transport().await?;
            transport.request("k").await
        };
        if quit_result.is_err() {
            if let Some(proc) = self.process.as_mut() {
                tracing::warn!(?tag, "quit command failed, killing emulator by held handle");
                proc.kill().await?;
            }
        }
        if let Some(mut proc) = self.process.take() {
            let _ = proc.kill().await;
        }
        Ok(())
    }

    fn tag(&self) -> Option<&str> {
        self.process.as_ref().map(|p| p.tag.as_str())
    }

    fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(|p| p.pid())
    }
}

fn hex_encode(s: &str) -> String {
    s.bytes().map(|b| format!("{b:02x}")).collect()
}

fn parse_stop_reply_addr(resp: &str) -> Result<u64> {
    for field in resp.split(';') {
        if let Some(hex) = field.strip_prefix("bkpt_addr:") {
            return u64::from_str_radix(hex, 16)
                .map_err(|_| GqfiError::Emulator(format!("malformed stop reply: {resp}")));
        }
    }
    Err(GqfiError::Emulator(format!(
        "stop reply missing bkpt_addr: {resp}"
    )))
}

/// Bind an ephemeral localhost UDP port for the serial side-channel
/// (spec.md §5: "each shard binds its own ephemeral port before spawning
/// the emulator").
pub fn bind_serial_sink() -> Result<(UdpSocket, u16)> {
    let socket = UdpSocket::bind("127.0.0.1:0")?;
    socket.set_read_timeout(Some(Duration::from_millis(500)))?;
    let port = socket.local_addr()?.port();
    Ok((socket, port))
}

/// An `Arc<dyn SymbolTable>` resolves exactly like the table it wraps, so
/// one shared, ELF-parsed table can back every [`QemuRspDriver`] a
/// [`crate::campaign::factory::QemuDriverFactory`] creates.
impl SymbolTable for std::sync::Arc<dyn SymbolTable> {
    fn resolve(&self, symbol: &str) -> Option<u64> {
        (**self).resolve(symbol)
    }
}

/// Forwards every [`EmulatorDriver`] method through a `Box<dyn
/// EmulatorDriver>`, since the trait's async methods are not themselves
/// object-safe-transparent through a box. Lets callers hold driver
/// instances as trait objects (one per shard restart) without knowing the
/// concrete `QemuRspDriver<S>` type parameter.
pub struct BoxedDriver(pub Box<dyn EmulatorDriver>);

#[async_trait]
impl EmulatorDriver for BoxedDriver {
    async fn start(&mut self, image32: &Path, disk: &Path, serial_sink_port: u16) -> Result<()> {
        self.0.start(image32, disk, serial_sink_port).await
    }

    async fn run_until(&mut self, symbols: &[&str]) -> Result<HitSymbol> {
        self.0.run_until(symbols).await
    }

    async fn save_snapshot(&mut self, tag: &str) -> Result<()> {
        self.0.save_snapshot(tag).await
    }

    async fn load_snapshot(&mut self, tag: &str, entry_symbol: &str) -> Result<()> {
        self.0.load_snapshot(tag, entry_symbol).await
    }

    async fn write_msr(&mut self, index: u32, value: u64) -> Result<()> {
        self.0.write_msr(index, value).await
    }

    async fn read_msr(&mut self, index: u32) -> Result<u64> {
        self.0.read_msr(index).await
    }

    async fn read_byte(&mut self, addr: u64) -> Result<u8> {
        self.0.read_byte(addr).await
    }

    async fn write_byte(&mut self, addr: u64, value: u8) -> Result<()> {
        self.0.write_byte(addr, value).await
    }

    async fn set_hw_breakpoint(&mut self, addr: u64) -> Result<()> {
        self.0.set_hw_breakpoint(addr).await
    }

    async fn clear_breakpoints(&mut self) -> Result<()> {
        self.0.clear_breakpoints().await
    }

    async fn set_write_watchpoint(&mut self, addr: u64) -> Result<()> {
        self.0.set_write_watchpoint(addr).await
    }

    async fn clear_watchpoints(&mut self) -> Result<()> {
        self.0.clear_watchpoints().await
    }

    async fn step_one(&mut self) -> Result<()> {
        self.0.step_one().await
    }

    async fn quit(&mut self) -> Result<()> {
        self.0.quit().await
    }

    fn tag(&self) -> Option<&str> {
        self.0.tag()
    }

    fn pid(&self) -> Option<u32> {
        self.0.pid()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bkpt_addr_from_stop_reply() {
        let addr = parse_stop_reply_addr("T05thread:1;bkpt_addr:1a2b;").unwrap();
        assert_eq!(addr, 0x1a2b);
    }

    #[test]
    fn rejects_stop_reply_without_bkpt_addr() {
        assert!(parse_stop_reply_addr("T05thread:1;").is_err());
    }

    #[test]
    fn binds_ephemeral_serial_sink() {
        let (_socket, port) = bind_serial_sink().unwrap();
        assert!(port > 0);
    }
}
