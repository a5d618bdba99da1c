//! Wire vocabulary for the nozzle serial link (spec §4.1).
//!
//! Outbound records are ASCII `verb(arg1,arg2,...)`; inbound records
//! share the same shape. This module defines the verb set, the
//! request/response family used for correlation, and a parsed
//! `NozzleFrame`. The actual transport lives in `refill-nozzle`.

use crate::error::Error;
use crate::model::{NozzleId, Tag};
use std::fmt;

/// The verb families used to correlate a reply with the request that
/// caused it. At most one request per family is ever outstanding
/// (spec §9, "single-writer discipline").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VerbFamily {
    Heartbeat,
    Nhb,
    RfidGet,
    RfidMatch,
    RfidAlarm,
    MeterRead,
    HlsRead,
}

/// A parsed inbound or outbound record.
#[derive(Debug, Clone, PartialEq)]
pub enum NozzleFrame {
    Heartbeat { status: u8 },
    Nhb { nozzle: NozzleId, flag: u32 },
    RfidGet { nozzle: NozzleId, tag: Tag, battery: u32 },
    RfidMatch { nozzle: NozzleId, seq: u64 },
    RfidAlarm { nozzle: NozzleId },
    MeterRead { liters: f64 },
    HlsRead { value: f64, denominator: u32 },
}

impl NozzleFrame {
    pub fn family(&self) -> VerbFamily {
        match self {
            NozzleFrame::Heartbeat { .. } => VerbFamily::Heartbeat,
            NozzleFrame::Nhb { .. } => VerbFamily::Nhb,
            NozzleFrame::RfidGet { .. } => VerbFamily::RfidGet,
            NozzleFrame::RfidMatch { .. } => VerbFamily::RfidMatch,
            NozzleFrame::RfidAlarm { .. } => VerbFamily::RfidAlarm,
            NozzleFrame::MeterRead { .. } => VerbFamily::MeterRead,
            NozzleFrame::HlsRead { .. } => VerbFamily::HlsRead,
        }
    }

    /// These verbs are always unsolicited, even if a request of the
    /// same family happens to be outstanding (spec §4.1).
    pub fn always_unsolicited(&self) -> bool {
        matches!(
            self,
            NozzleFrame::RfidMatch { .. } | NozzleFrame::RfidAlarm { .. } | NozzleFrame::Nhb { .. }
        )
    }

    /// Parses a single line (without the trailing newline) into a
    /// frame. Returns `Error::Malformed` for anything that doesn't
    /// match a known verb grammar; callers log and drop (spec §7.3).
    pub fn parse(line: &str) -> Result<NozzleFrame, Error> {
        let (verb, args) = split_verb(line)?;

        match verb {
            "heartbeat" => {
                let [status] = args1(args, line)?;
                Ok(NozzleFrame::Heartbeat {
                    status: parse_u8(status, line)?,
                })
            }
            "nhb" => {
                let [nozzle, flag] = args2(args, line)?;
                Ok(NozzleFrame::Nhb {
                    nozzle: parse_nozzle(nozzle, line)?,
                    flag: parse_u32(flag, line)?,
                })
            }
            "rfid_get" => {
                let [nozzle, tag, battery] = args3(args, line)?;
                Ok(NozzleFrame::RfidGet {
                    nozzle: parse_nozzle(nozzle, line)?,
                    tag: Tag::parse(tag)
                        .ok_or_else(|| Error::Malformed(format!("bad tag in {:?}", line)))?,
                    battery: parse_u32(battery, line)?,
                })
            }
            "rfid_match" => {
                let [nozzle, seq] = args2(args, line)?;
                Ok(NozzleFrame::RfidMatch {
                    nozzle: parse_nozzle(nozzle, line)?,
                    seq: parse_u64(seq, line)?,
                })
            }
            "rfid_alarm" => {
                let [nozzle] = args1(args, line)?;
                Ok(NozzleFrame::RfidAlarm {
                    nozzle: parse_nozzle(nozzle, line)?,
                })
            }
            "meter_read" => {
                let [liters] = args1(args, line)?;
                Ok(NozzleFrame::MeterRead {
                    liters: parse_f64(liters, line)?,
                })
            }
            "hls_read" => {
                let [value, denom] = args2(args, line)?;
                Ok(NozzleFrame::HlsRead {
                    value: parse_f64(value, line)?,
                    denominator: parse_u32(denom, line)?,
                })
            }
            other => Err(Error::Malformed(format!("unknown verb {:?} in {:?}", other, line))),
        }
    }
}

/// A command the supervisor can issue. `expect_response()` says
/// whether the port should correlate a reply (spec §4.1).
#[derive(Debug, Clone, PartialEq)]
pub enum NozzleCommand {
    PairNozzle(NozzleId),
    SetSolenoid(NozzleId, bool),
    MeterReset(NozzleId),
    MeterRead(NozzleId),
    RfidGet(NozzleId),
    RfidGetCont(NozzleId, Tag),
    RfidGetStop(NozzleId),
    RfidStop(NozzleId),
    Cbhb(NozzleId),
    Heartbeat,
    HlsRead(u32, u32),
}

impl NozzleCommand {
    pub fn expect_response(&self) -> bool {
        matches!(
            self,
            NozzleCommand::Heartbeat
                | NozzleCommand::MeterRead(_)
                | NozzleCommand::RfidGet(_)
                | NozzleCommand::HlsRead(_, _)
        )
    }

    pub fn family(&self) -> Option<VerbFamily> {
        match self {
            NozzleCommand::Heartbeat => Some(VerbFamily::Heartbeat),
            NozzleCommand::MeterRead(_) => Some(VerbFamily::MeterRead),
            NozzleCommand::RfidGet(_) => Some(VerbFamily::RfidGet),
            NozzleCommand::HlsRead(_, _) => Some(VerbFamily::HlsRead),
            _ => None,
        }
    }
}

impl fmt::Display for NozzleCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NozzleCommand::PairNozzle(n) => write!(f, "pair_nozzle({})", n),
            NozzleCommand::SetSolenoid(n, open) => {
                write!(f, "set_solenoid({},{})", n, if *open { 1 } else { 0 })
            }
            NozzleCommand::MeterReset(n) => write!(f, "meter_reset({})", n),
            NozzleCommand::MeterRead(n) => write!(f, "meter_read({})", n),
            NozzleCommand::RfidGet(n) => write!(f, "rfid_get({})", n),
            NozzleCommand::RfidGetCont(n, tag) => write!(f, "rfid_get_cont({},{})", n, tag),
            NozzleCommand::RfidGetStop(n) => write!(f, "rfid_get_stop({})", n),
            NozzleCommand::RfidStop(n) => write!(f, "rfid_stop({})", n),
            NozzleCommand::Cbhb(n) => write!(f, "cbhb({})", n),
            NozzleCommand::Heartbeat => write!(f, "heartbeat()"),
            NozzleCommand::HlsRead(ms, socket) => write!(f, "hls_read({},{})", ms, socket),
        }
    }
}

fn split_verb(line: &str) -> Result<(&str, &str), Error> {
    let open = line
        .find('(')
        .ok_or_else(|| Error::Malformed(format!("no '(' in {:?}", line)))?;
    if !line.ends_with(')') {
        return Err(Error::Malformed(format!("no trailing ')' in {:?}", line)));
    }
    Ok((&line[..open], &line[open + 1..line.len() - 1]))
}

fn args1<'a>(args: &'a str, line: &str) -> Result<[&'a str; 1], Error> {
    let v: Vec<&str> = args.split(',').collect();
    v.try_into()
        .map_err(|_| Error::Malformed(format!("wrong arity in {:?}", line)))
}

fn args2<'a>(args: &'a str, line: &str) -> Result<[&'a str; 2], Error> {
    let v: Vec<&str> = args.split(',').collect();
    v.try_into()
        .map_err(|_| Error::Malformed(format!("wrong arity in {:?}", line)))
}

fn args3<'a>(args: &'a str, line: &str) -> Result<[&'a str; 3], Error> {
    let v: Vec<&str> = args.split(',').collect();
    v.try_into()
        .map_err(|_| Error::Malformed(format!("wrong arity in {:?}", line)))
}

fn parse_nozzle(s: &str, line: &str) -> Result<NozzleId, Error> {
    s.parse()
        .map_err(|_| Error::Malformed(format!("bad nozzle id in {:?}", line)))
}

fn parse_u8(s: &str, line: &str) -> Result<u8, Error> {
    s.parse().map_err(|_| Error::Malformed(format!("bad integer in {:?}", line)))
}

fn parse_u32(s: &str, line: &str) -> Result<u32, Error> {
    s.parse().map_err(|_| Error::Malformed(format!("bad integer in {:?}", line)))
}

fn parse_u64(s: &str, line: &str) -> Result<u64, Error> {
    s.parse().map_err(|_| Error::Malformed(format!("bad integer in {:?}", line)))
}

fn parse_f64(s: &str, line: &str) -> Result<f64, Error> {
    s.parse().map_err(|_| Error::Malformed(format!("bad decimal in {:?}", line)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rfid_get_with_tag() {
        let f = NozzleFrame::parse("rfid_get(0076,E200001D8914005717701BFC,2013)").unwrap();
        assert_eq!(
            f,
            NozzleFrame::RfidGet {
                nozzle: "0076".parse().unwrap(),
                tag: Tag::Present("E200001D8914005717701BFC".into()),
                battery: 2013,
            }
        );
    }

    #[test]
    fn parses_rfid_get_with_no_tag() {
        let f = NozzleFrame::parse("rfid_get(0076,-,2013)").unwrap();
        assert_eq!(
            f,
            NozzleFrame::RfidGet {
                nozzle: "0076".parse().unwrap(),
                tag: Tag::None,
                battery: 2013,
            }
        );
    }

    #[test]
    fn parses_meter_read() {
        assert_eq!(
            NozzleFrame::parse("meter_read(12.3)").unwrap(),
            NozzleFrame::MeterRead { liters: 12.3 }
        );
    }

    #[test]
    fn rejects_malformed() {
        assert!(NozzleFrame::parse("meter_read(12.3").is_err());
        assert!(NozzleFrame::parse("bogus(1,2)").is_err());
        assert!(NozzleFrame::parse("rfid_alarm(12,34)").is_err());
    }

    #[test]
    fn always_unsolicited_verbs() {
        let f = NozzleFrame::RfidMatch {
            nozzle: "0076".parse().unwrap(),
            seq: 1,
        };
        assert!(f.always_unsolicited());

        let f = NozzleFrame::MeterRead { liters: 1.0 };
        assert!(!f.always_unsolicited());
    }

    #[test]
    fn command_rendering() {
        let n: NozzleId = "0076".parse().unwrap();
        assert_eq!(NozzleCommand::SetSolenoid(n, true).to_string(), "set_solenoid(0076,1)");
        assert_eq!(NozzleCommand::RfidGet(n).to_string(), "rfid_get(0076)");
    }
}
