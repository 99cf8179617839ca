//! Probe report shapes and their normalization
//!
//! Two shapes come back from the capability:
//!
//! * [`StructuredReport`], parsed from nmap XML (`-oX`),
//! * [`SimplifiedReport`], parsed from nmap greppable output (`-oG`).
//!
//! Both keep port fields as raw text. [`ProbeReport::open_ports`] is the single
//! place where text becomes [`PortObservation`]s.

use crate::error::ProbeFailure;
use crate::model::{PortObservation, ProbeStrategy, Protocol};
use log::warn;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

/// Port entry exactly as the report spelled it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawPort {
    pub protocol: String,
    pub portid: String,
    pub state: String,
    pub service: Option<String>,
}

impl RawPort {
    pub fn new(protocol: &str, portid: &str, state: &str, service: Option<&str>) -> Self {
        Self {
            protocol: protocol.to_string(),
            portid: portid.to_string(),
            state: state.to_string(),
            service: service.map(str::to_string),
        }
    }

    fn is_open(&self) -> bool {
        self.state.eq_ignore_ascii_case("open")
    }

    /// Normalize, or explain why the entry is malformed
    fn to_observation(&self) -> Result<PortObservation, String> {
        let port = self
            .portid
            .trim()
            .parse::<u16>()
            .map_err(|_| format!("port '{}' is not in 0-65535", self.portid))?;
        let protocol = if self.protocol.trim().is_empty() {
            Protocol::Tcp
        } else {
            self.protocol.parse::<Protocol>()?
        };
        let service = match self.service.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => "unknown".to_string(),
        };
        Ok(PortObservation::new(protocol, port, service))
    }
}

/// Ports reported for one host, in report order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostPorts {
    pub addresses: Vec<String>,
    pub ports: Vec<RawPort>,
    /// The capability gave up on this host before finishing
    pub timed_out: bool,
}

impl HostPorts {
    fn matches(&self, address: &str) -> bool {
        self.addresses.iter().any(|a| a == address)
    }
}

/// Report parsed from nmap XML output
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StructuredReport {
    pub hosts: Vec<HostPorts>,
}

/// Report parsed from nmap greppable output
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimplifiedReport {
    pub hosts: Vec<HostPorts>,
}

/// Either report shape
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeReport {
    Structured(StructuredReport),
    Simplified(SimplifiedReport),
}

impl ProbeReport {
    fn hosts(&self) -> &[HostPorts] {
        match self {
            ProbeReport::Structured(r) => &r.hosts,
            ProbeReport::Simplified(r) => &r.hosts,
        }
    }

    /// Whether the report carries any entry for `address`
    pub fn has_host(&self, address: &str) -> bool {
        self.hosts().iter().any(|h| h.matches(address))
    }

    /// Whether the scan of `address` hit its host timeout.
    ///
    /// nmap still exits 0 in that case, so this is the only sign of it.
    pub fn timed_out(&self, address: &str) -> bool {
        self.hosts().iter().any(|h| h.matches(address) && h.timed_out)
    }

    /// Open ports reported for `address`, in report order.
    ///
    /// An address missing from the report yields an empty list. Malformed
    /// entries are logged and skipped.
    pub fn open_ports(&self, address: &str, label: ProbeStrategy) -> Vec<PortObservation> {
        let mut observations = Vec::new();

        for host in self.hosts().iter().filter(|h| h.matches(address)) {
            for raw in host.ports.iter().filter(|p| p.is_open()) {
                match raw.to_observation() {
                    Ok(obs) => observations.push(obs.with_label(label)),
                    Err(reason) => warn!("Skipping malformed port entry for {}: {}", address, reason),
                }
            }
        }

        observations
    }
}

fn attr(element: &BytesStart<'_>, name: &str) -> Result<Option<String>, ProbeFailure> {
    let attribute = element
        .try_get_attribute(name)
        .map_err(|e| ProbeFailure::Parse(e.to_string()))?;
    match attribute {
        Some(a) => a
            .unescape_value()
            .map(|v| Some(v.into_owned()))
            .map_err(|e| ProbeFailure::Parse(e.to_string())),
        None => Ok(None),
    }
}

impl StructuredReport {
    /// Parse nmap `-oX` output
    pub fn parse(xml: &str) -> Result<Self, ProbeFailure> {
        if xml.trim().is_empty() {
            return Err(ProbeFailure::Parse("empty XML report".to_string()));
        }

        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        let mut report = StructuredReport::default();
        let mut seen_root = false;
        let mut host: Option<HostPorts> = None;
        let mut port: Option<RawPort> = None;

        loop {
            let event = reader
                .read_event()
                .map_err(|e| ProbeFailure::Parse(format!("at byte {}: {}", reader.buffer_position(), e)))?;

            match event {
                Event::Start(ref e) | Event::Empty(ref e) => {
                    let empty = matches!(event, Event::Empty(_));
                    match e.name().as_ref() {
                        b"nmaprun" => seen_root = true,
                        b"host" if !empty => {
                            host = Some(HostPorts {
                                timed_out: attr(e, "timedout")?.as_deref() == Some("true"),
                                ..HostPorts::default()
                            })
                        }
                        b"address" => {
                            if let (Some(h), Some(addr)) = (host.as_mut(), attr(e, "addr")?) {
                                h.addresses.push(addr);
                            }
                        }
                        b"port" if host.is_some() => {
                            let raw = RawPort {
                                protocol: attr(e, "protocol")?.unwrap_or_default(),
                                portid: attr(e, "portid")?.unwrap_or_default(),
                                ..RawPort::default()
                            };
                            if empty {
                                if let Some(h) = host.as_mut() {
                                    h.ports.push(raw);
                                }
                            } else {
                                port = Some(raw);
                            }
                        }
                        b"state" => {
                            if let Some(p) = port.as_mut() {
                                p.state = attr(e, "state")?.unwrap_or_default();
                            }
                        }
                        b"service" => {
                            if let Some(p) = port.as_mut() {
                                p.service = attr(e, "name")?;
                            }
                        }
                        _ => {}
                    }
                }
                Event::End(ref e) => match e.name().as_ref() {
                    b"port" => {
                        if let (Some(h), Some(p)) = (host.as_mut(), port.take()) {
                            h.ports.push(p);
                        }
                    }
                    b"host" => {
                        if let Some(h) = host.take() {
                            report.hosts.push(h);
                        }
                    }
                    _ => {}
                },
                Event::Eof => break,
                _ => {}
            }
        }

        if !seen_root {
            return Err(ProbeFailure::Parse("not an nmap XML report".to_string()));
        }

        Ok(report)
    }
}

impl SimplifiedReport {
    /// Parse nmap `-oG` output.
    ///
    /// Lines look like
    /// `Host: 10.0.0.1 ()\tPorts: 22/open/tcp//ssh///, 80/closed/tcp//http///`.
    pub fn parse(text: &str) -> Result<Self, ProbeFailure> {
        let mut report = SimplifiedReport::default();
        let mut recognised = false;

        for line in text.lines() {
            let line = line.trim_end();
            if line.starts_with("# Nmap") {
                recognised = true;
                continue;
            }
            let Some(rest) = line.strip_prefix("Host: ") else {
                continue;
            };
            recognised = true;

            let mut fields = rest.split('\t');
            let address = match fields.next().and_then(|f| f.split_whitespace().next()) {
                Some(a) => a.to_string(),
                None => continue,
            };

            let mut ports = Vec::new();
            let mut timed_out = false;
            for field in fields {
                if let Some(list) = field.strip_prefix("Ports: ") {
                    ports.extend(list.split(',').filter_map(Self::parse_entry));
                } else if field.trim() == "Status: Timeout" {
                    timed_out = true;
                }
            }

            // Greppable output repeats the host on a Status line and a Ports line
            match report.hosts.iter_mut().find(|h| h.matches(&address)) {
                Some(existing) => {
                    existing.ports.extend(ports);
                    existing.timed_out |= timed_out;
                }
                None => report.hosts.push(HostPorts {
                    addresses: vec![address],
                    ports,
                    timed_out,
                }),
            }
        }

        if !recognised {
            return Err(ProbeFailure::Parse("not an nmap greppable report".to_string()));
        }

        Ok(report)
    }

    fn parse_entry(entry: &str) -> Option<RawPort> {
        // port/state/protocol/owner/service/rpc/version/
        let parts: Vec<&str> = entry.trim().split('/').collect();
        if parts.len() < 3 {
            warn!("Skipping malformed greppable port entry '{}'", entry.trim());
            return None;
        }
        let service = parts.get(4).copied().filter(|s| !s.is_empty());
        Some(RawPort::new(parts[2], parts[0], parts[1], service))
    }
}
