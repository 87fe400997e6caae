//! Multi-function decoder instruction grammar
//!
//! The top three bits of the byte after the address select the instruction
//! group; each group has its own fixed bit-field layout for speed,
//! direction, function bits or CV access.

use crate::config::SpeedSteps;
use crate::core::AnnotationCategory;
use crate::packet::PacketView;

const WEEKDAYS: [&str; 8] = [
    "Monday", "Tuesday", "Wednesday", "Thursday", "Friday", "Saturday", "Sunday", "?",
];
const WEEKDAYS_SHORT: [&str; 8] = ["Mo", "Tu", "We", "Th", "Fr", "Sa", "Su", "?"];
const MONTHS: [&str; 16] = [
    "?", "Jan. ", "Feb. ", "Mar. ", "Apr. ", "May ", "Jun. ", "Jul. ", "Aug. ", "Sep. ", "Oct. ",
    "Nov. ", "Dec. ", "?", "?", "?",
];

/// Decode the instruction byte at `pos` and everything it consumes.
///
/// Returns the position of the last consumed byte, or `None` when a byte
/// the instruction needs is missing.
pub(crate) fn decode_instruction(
    v: &mut PacketView<'_>,
    pos: usize,
    dec_addr: u16,
    speed_steps: SpeedSteps,
) -> Option<usize> {
    let instruction = v.value(pos);
    let cmd = (instruction & 0b1110_0000) >> 5;
    let subcmd = instruction & 0b0001_1111;
    match cmd {
        0b000 => decoder_control(v, pos, subcmd),
        0b001 => advanced_operations(v, pos, subcmd, dec_addr),
        0b010 | 0b011 => basic_speed(v, pos, cmd, subcmd, dec_addr, speed_steps),
        0b100 => function_group_one(v, pos, subcmd, speed_steps),
        0b101 => function_group_two(v, pos, subcmd),
        0b110 => future_expansion(v, pos, subcmd, dec_addr),
        _ => cv_access(v, pos, subcmd),
    }
}

/// Direction/speed labels of a 126 step speed byte
fn speed128_labels(byte: u8, dec_addr: u16) -> (String, String) {
    let (long, short) = if dec_addr == 0 {
        ("Broadcast", "B")
    } else if byte >> 7 == 1 {
        ("Forward", "F")
    } else {
        ("Reverse", "R")
    };
    match byte & 0b0111_1111 {
        0b0000_0000 => (format!("STOP ({})", long), format!("STOP ({})", short)),
        0b0000_0001 => (
            format!("EMERGENCY STOP (HALT) ({})", long),
            format!("ESTOP ({})", short),
        ),
        speed => (
            format!("{} Speed: {} / 126", long, speed - 1),
            format!("{}:{}", short, speed - 1),
        ),
    }
}

/// Long/short labels for an 8 bit function group starting at F`first`
fn function_byte_labels(first: u32, value: u8) -> (String, String) {
    let mut long = String::new();
    let mut short = format!("F{}:", first);
    let mut value = value;
    for i in 0..8 {
        long.push_str(&format!("F{}:{}", first + i, value & 1));
        short.push_str(&(value & 1).to_string());
        if i < 7 {
            long.push_str(", ");
            short.push(',');
        }
        value >>= 1;
    }
    (long, short)
}

/// Shared rendering of a CV bit-manipulation byte (operation, bit
/// position, bit value)
pub(crate) fn annotate_bit_manipulation(v: &mut PacketView<'_>, pos: usize) {
    let byte = v.value(pos);
    let (mut long, mut short) = if byte & 0b0001_0000 != 0 {
        ("Write, ".to_string(), "w,".to_string())
    } else {
        ("Verify, ".to_string(), "v,".to_string())
    };
    long.push_str(&(byte & 0b0000_0111).to_string());
    short.push_str(&(byte & 0b0000_0111).to_string());
    if byte & 0b1000 != 0 {
        long.push_str(", 1");
        short.push_str(",1");
    } else {
        long.push_str(", 0");
        short.push_str(",0");
    }
    v.emit_byte(pos, AnnotationCategory::Data, &[&long, &short]);
    v.emit_byte(
        pos,
        AnnotationCategory::Command,
        &["Operation, Position, Value", "Op.,Pos,Value", "O,P,V"],
    );
}

fn decoder_control(v: &mut PacketView<'_>, pos: usize, subcmd: u8) -> Option<usize> {
    match subcmd {
        0b00000 => {
            v.emit_byte(
                pos,
                AnnotationCategory::Command,
                &["Decoder Reset", "Dec. Reset", "Reset"],
            );
            Some(pos)
        }
        0b00001 => {
            v.emit_byte(
                pos,
                AnnotationCategory::Command,
                &["Decoder Hard Reset", "Hard Reset", "Reset"],
            );
            Some(pos)
        }
        s if s & 0b11110 == 0b00010 => {
            v.emit_byte(
                pos,
                AnnotationCategory::Command,
                &["Factory Test Instruction", "Fac. Test", "Test"],
            );
            v.valid_packet = true;
            Some(pos)
        }
        s if s & 0b11110 == 0b01010 => {
            let label = (v.value(pos) & 1).to_string();
            v.emit_byte(pos, AnnotationCategory::Data, &[&label]);
            v.emit_byte(
                pos,
                AnnotationCategory::Command,
                &[
                    "Set Advanced Addressing (CV #29 Bit 5)",
                    "Set advanced addressing",
                    "Set adv. addr.",
                ],
            );
            Some(pos)
        }
        0b01111 => {
            v.emit_byte(
                pos,
                AnnotationCategory::Command,
                &["Decoder Acknowledgment Request", "Dec. Ack Req.", "Ack Req."],
            );
            Some(pos)
        }
        s if s & 0b10000 != 0 => {
            v.emit_byte(pos, AnnotationCategory::Command, &["Consist Control"]);
            let pos = v.advance(pos)?;
            if subcmd & 0b11110 == 0b10010 {
                let direction = if v.value(pos - 1) & 1 == 0 {
                    "normal"
                } else {
                    "reverse"
                };
                let label = format!("{}, dir:{}", v.value(pos) & 0b0111_1111, direction);
                v.emit_byte(pos, AnnotationCategory::Data, &[&label]);
                v.emit_byte(
                    pos,
                    AnnotationCategory::Command,
                    &["Set consist address", "Set"],
                );
            } else {
                v.emit_byte(pos, AnnotationCategory::Command, &["Reserved"]);
            }
            Some(pos)
        }
        _ => {
            v.emit_byte(pos, AnnotationCategory::Command, &["Reserved"]);
            Some(pos)
        }
    }
}

fn advanced_operations(
    v: &mut PacketView<'_>,
    pos: usize,
    subcmd: u8,
    dec_addr: u16,
) -> Option<usize> {
    match subcmd {
        0b11111 => {
            v.emit_byte(
                pos,
                AnnotationCategory::Command,
                &["128 Speed Step Control - Instruction", "128 Speed Step"],
            );
            let pos = v.advance(pos)?;
            let (long, short) = speed128_labels(v.value(pos), dec_addr);
            v.emit_byte(pos, AnnotationCategory::Data, &[&long, &short]);
            Some(pos)
        }
        0b11110 => {
            let pos = v.advance(pos)?;
            v.emit_bytes(
                pos - 1,
                pos,
                AnnotationCategory::Command,
                &[
                    "Special operation mode (unless received via consist address in CV#19)",
                    "Special operation mode",
                ],
            );
            let byte = v.value(pos);
            let mut label = match (byte >> 2) & 0b11 {
                0b00 => "Not part of a multiple traction",
                0b10 => "Leading loco of multiple traction",
                0b01 => "Middle loco in a multiple traction",
                _ => "Final loco of a multiple traction",
            }
            .to_string();
            label.push_str(&format!(
                ", shunting key:{}, west-bit:{}, east-bit:{}, MAN-bit:{}",
                (byte >> 4) & 1,
                (byte >> 5) & 1,
                (byte >> 6) & 1,
                (byte >> 7) & 1
            ));
            v.emit_bytes(pos - 1, pos, AnnotationCategory::Data, &[&label]);
            Some(pos)
        }
        0b11101 => {
            v.emit_byte(pos, AnnotationCategory::Command, &["Analog Function Group"]);
            let pos = v.advance(pos)?;
            let byte = v.value(pos);
            match byte {
                0b0000_0001 => {
                    v.emit_byte(pos, AnnotationCategory::Command, &["Volume control"]);
                }
                0b0001_0000..=0b0001_1111 => {
                    let label = (byte & 0b0000_1111).to_string();
                    v.emit_byte(pos, AnnotationCategory::Data, &[&label]);
                    v.emit_byte(pos, AnnotationCategory::Command, &["Position control"]);
                }
                0b1000_0000..=0b1111_1111 => {
                    let label = (byte & 0b0111_1111).to_string();
                    v.emit_byte(pos, AnnotationCategory::Data, &[&label]);
                    v.emit_byte(pos, AnnotationCategory::Command, &["Any control"]);
                }
                _ => {
                    v.emit_byte(pos, AnnotationCategory::Command, &["Reserved"]);
                }
            }
            let pos = v.advance(pos)?;
            let label = v.value(pos).to_string();
            v.emit_byte(pos, AnnotationCategory::Data, &[&label]);
            v.emit_byte(pos, AnnotationCategory::Command, &["Data"]);
            Some(pos)
        }
        0b11100 => {
            v.emit_byte(
                pos,
                AnnotationCategory::Command,
                &["Speed, Direction, Function"],
            );
            let mut pos = v.advance(pos)?;
            let (long, short) = speed128_labels(v.value(pos), dec_addr);
            v.emit_byte(pos, AnnotationCategory::Data, &[&long, &short]);
            for first in [0u32, 8, 16, 24] {
                if v.len() > pos + 2 {
                    pos = v.advance(pos)?;
                    let (long, short) = function_byte_labels(first, v.value(pos));
                    v.emit_byte(pos, AnnotationCategory::Data, &[&long, &short]);
                } else {
                    break;
                }
            }
            Some(pos)
        }
        _ => {
            v.emit_byte(pos, AnnotationCategory::Command, &["Reserved"]);
            Some(pos)
        }
    }
}

fn basic_speed(
    v: &mut PacketView<'_>,
    pos: usize,
    cmd: u8,
    subcmd: u8,
    dec_addr: u16,
    speed_steps: SpeedSteps,
) -> Option<usize> {
    let speed14 = speed_steps == SpeedSteps::Mode14;
    if speed14 {
        v.emit_byte(
            pos,
            AnnotationCategory::Command,
            &[
                "Basic Speed and Direction Instruction 14 speed step mode (CV#29=0)",
                "Speed + Dir. 14 step",
                "Speed 14",
            ],
        );
    } else {
        v.emit_byte(
            pos,
            AnnotationCategory::Command,
            &[
                "Basic Speed and Direction Instruction 28 speed step mode (CV#29=1)",
                "Speed + Dir. 28 step",
                "Speed 28",
            ],
        );
    }

    let bit5 = (subcmd & 0b10000) >> 4;
    let (base_long, base_short) = if dec_addr == 0 {
        ("Broadcast", "B")
    } else if cmd & 0b001 != 0 {
        ("Forward", "F")
    } else {
        ("Reverse", "R")
    };
    let (mut long14, mut short14, long28, short28) = match subcmd & 0b01111 {
        0b00000 => (
            format!("STOP ({})", base_long),
            format!("STOP ({})", base_short),
            format!("STOP ({})", base_long),
            format!("STOP ({})", base_short),
        ),
        0b00001 => (
            format!("EMERGENCY STOP (HALT) ({})", base_long),
            format!("ESTOP ({})", base_short),
            format!("EMERGENCY STOP (HALT) ({})", base_long),
            format!("ESTOP ({})", base_short),
        ),
        code => {
            let speed14_value = code - 1;
            let speed28_value = ((i16::from(code) - 1) * 2 - 1) + i16::from(bit5);
            (
                format!("{} Speed: {} / 14", base_long, speed14_value),
                format!("{}:{}", base_short, speed14_value),
                format!("{} Speed: {} / 28", base_long, speed28_value),
                format!("{}:{}", base_short, speed28_value),
            )
        }
    };
    if dec_addr > 0 {
        long14.push_str(&format!(", F0={}", bit5));
        short14.push_str(&format!(", F0={}", bit5));
    }
    if speed14 {
        v.emit_byte(pos, AnnotationCategory::Data, &[&long14, &short14]);
    } else {
        v.emit_byte(pos, AnnotationCategory::Data, &[&long28, &short28]);
    }
    Some(pos)
}

fn function_group_one(
    v: &mut PacketView<'_>,
    pos: usize,
    subcmd: u8,
    speed_steps: SpeedSteps,
) -> Option<usize> {
    let speed14 = speed_steps == SpeedSteps::Mode14;
    if speed14 {
        v.emit_byte(
            pos,
            AnnotationCategory::Command,
            &[
                "Function Group One Instruction 14 speed step mode (CV#29=0)",
                "FG1 14 step",
                "FG1",
            ],
        );
    } else {
        v.emit_byte(
            pos,
            AnnotationCategory::Command,
            &[
                "Function Group One Instruction 28/128 speed step mode (CV#29=1)",
                "FG1 28/128 step",
                "FG1",
            ],
        );
    }

    let mut long = String::new();
    let mut short = String::new();
    let mut value = subcmd;
    for f in 1..=4 {
        long.push_str(&format!("F{}:{}", f, value & 1));
        short.push_str(&(value & 1).to_string());
        if f < 4 {
            long.push_str(", ");
            short.push(',');
        }
        value >>= 1;
    }
    if speed14 {
        short = format!("F1:{}", short);
    } else {
        long = format!("F0:{}, {}", subcmd >> 4, long);
        short = format!("F0:{},{}", subcmd >> 4, short);
    }
    v.emit_byte(pos, AnnotationCategory::Data, &[&long, &short]);
    Some(pos)
}

fn function_group_two(v: &mut PacketView<'_>, pos: usize, subcmd: u8) -> Option<usize> {
    v.emit_byte(
        pos,
        AnnotationCategory::Command,
        &["Function Group Two Instruction", "FG2"],
    );
    let first = if subcmd & 0b10000 != 0 { 5 } else { 9 };
    let mut long = String::new();
    let mut short = format!("F{}:", first);
    let mut value = subcmd;
    for i in 0..4 {
        long.push_str(&format!("F{}:{}", first + i, value & 1));
        short.push_str(&(value & 1).to_string());
        if i < 3 {
            long.push_str(", ");
            short.push(',');
        }
        value >>= 1;
    }
    v.emit_byte(pos, AnnotationCategory::Data, &[&long, &short]);
    Some(pos)
}

fn future_expansion(
    v: &mut PacketView<'_>,
    pos: usize,
    subcmd: u8,
    dec_addr: u16,
) -> Option<usize> {
    let pos = v.advance(pos)?;
    v.emit_byte(
        pos - 1,
        AnnotationCategory::Command,
        &["Future Expansion Instruction"],
    );

    match subcmd {
        0b11111 | 0b11110 | 0b11100 | 0b11011 | 0b11010 | 0b11001 | 0b11000 => {
            let first = match subcmd {
                0b11110 => 13,
                0b11111 => 21,
                0b11000 => 29,
                0b11001 => 37,
                0b11010 => 45,
                0b11011 => 53,
                _ => 61,
            };
            let (long, short) = function_byte_labels(first, v.value(pos));
            v.emit_byte(pos, AnnotationCategory::Data, &[&long, &short]);
            Some(pos)
        }
        0b11101 => {
            let byte = v.value(pos);
            let address = byte & 0b0111_1111;
            v.emit_byte(
                pos - 1,
                AnnotationCategory::Data,
                &["Binary State Control Instruction short form", "Binarystate short"],
            );
            match address {
                0 => {
                    let label = (byte >> 7).to_string();
                    v.emit_byte(pos, AnnotationCategory::Data, &[&label]);
                    v.emit_byte(pos, AnnotationCategory::Command, &["Broadcast F29-F127"]);
                }
                1..=15 => {
                    let (mut long, mut short) = match address {
                        1 if byte >> 7 == 0 => {
                            ("XF=1 (Requesting the location information)".to_string(), "XF=1".to_string())
                        }
                        1 => ("XF=1".to_string(), "XF=1".to_string()),
                        2 if byte >> 7 == 0 => ("XF=2 (Rerail search)".to_string(), "XF=2".to_string()),
                        2 => ("XF=2".to_string(), "XF=2".to_string()),
                        a => (format!("XF={} (Reserved)", a), format!("XF={} (Res.)", a)),
                    };
                    let state = if byte >> 7 == 0 { ":off" } else { ":on" };
                    long.push_str(state);
                    short.push_str(state);
                    v.emit_byte(pos, AnnotationCategory::Data, &[&long, &short]);
                    v.emit_byte(pos, AnnotationCategory::Command, &["RailCom"]);
                }
                16..=28 => {
                    let label = format!("0x{:02x}/{}", byte, byte);
                    v.emit_byte(pos, AnnotationCategory::Data, &[&label]);
                    v.emit_byte(pos, AnnotationCategory::Command, &["Special uses"]);
                }
                _ => {
                    let state = if v.value(pos - 1) >> 7 == 0 { "off" } else { "on" };
                    let label = format!("F{}:{}", address, state);
                    v.emit_byte(pos, AnnotationCategory::Data, &[&label]);
                }
            }
            Some(pos)
        }
        0b00000 => {
            v.emit_byte(
                pos - 1,
                AnnotationCategory::Data,
                &["Binary State Control Instruction long form", "Binarystate long"],
            );
            let pos = v.advance(pos)?;
            let address =
                u32::from(v.value(pos)) * 128 + u32::from(v.value(pos - 1) & 0b0111_1111);
            let state = if v.value(pos - 1) >> 7 == 0 { "off" } else { "on" };
            if address == 0 {
                v.emit_bytes(pos - 1, pos, AnnotationCategory::Data, &[state]);
                v.emit_bytes(
                    pos - 1,
                    pos,
                    AnnotationCategory::Command,
                    &["Broadcast F29-F32767"],
                );
            } else if v.value(pos - 1) & 0b0111_1111 == 0 {
                v.emit_bytes(
                    pos - 1,
                    pos,
                    AnnotationCategory::Error,
                    &["Use binarystate short", "Error", "E"],
                );
            } else {
                let label = format!("F{}:{}", address, state);
                v.emit_bytes(pos - 1, pos, AnnotationCategory::Data, &[&label]);
            }
            Some(pos)
        }
        0b00001 => {
            if dec_addr != 0 {
                v.emit_bytes(
                    0,
                    v.len() - 2,
                    AnnotationCategory::Error,
                    &["Only Broadcast allowed", "Error", "E"],
                );
            }
            let byte = v.value(pos);
            let (pos, long, short) = match (byte >> 6) & 0b11 {
                0b00 => {
                    v.emit_byte(pos - 1, AnnotationCategory::Data, &["Model-Time"]);
                    v.emit_byte(pos, AnnotationCategory::Command, &["00MMMMMM"]);
                    let pos = v.advance(pos)?;
                    v.emit_byte(pos, AnnotationCategory::Command, &["WWWHHHHH"]);
                    let pos = v.advance(pos)?;
                    v.emit_byte(pos, AnnotationCategory::Command, &["U0BBBBBB"]);
                    let weekday = (v.value(pos - 1) >> 5) as usize;
                    let hour = v.value(pos - 1) & 0b0001_1111;
                    let minute = v.value(pos - 2) & 0b0011_1111;
                    let long = format!(
                        "{} {:02}:{:02} hrs, Update:{}, Acceleration:{}",
                        WEEKDAYS[weekday],
                        hour,
                        minute,
                        v.value(pos) >> 7,
                        v.value(pos) & 0b0011_1111
                    );
                    let short = format!(
                        "{} {:02}:{:02}, U:{}, Acc:{}",
                        WEEKDAYS_SHORT[weekday],
                        hour,
                        minute,
                        v.value(pos) >> 7,
                        v.value(pos) & 0b0011_1111
                    );
                    (pos, long, short)
                }
                0b01 => {
                    v.emit_byte(pos - 1, AnnotationCategory::Data, &["Model-Date"]);
                    v.emit_byte(pos, AnnotationCategory::Command, &["010TTTTT"]);
                    let pos = v.advance(pos)?;
                    v.emit_byte(pos, AnnotationCategory::Command, &["MMMMYYYY"]);
                    let pos = v.advance(pos)?;
                    v.emit_byte(pos, AnnotationCategory::Command, &["YYYYYYYY"]);
                    let day = v.value(pos - 2) & 0b0001_1111;
                    let month = (v.value(pos - 1) >> 4) as usize;
                    let year =
                        (u32::from(v.value(pos - 1) & 0b0000_1111) << 8) + u32::from(v.value(pos));
                    let long = format!("{}. {}{}", day, MONTHS[month], year);
                    let short = format!("{}.{}.{}", day, month, year);
                    (pos, long, short)
                }
                _ => {
                    v.emit_byte(pos - 1, AnnotationCategory::Data, &["Reserved"]);
                    (pos, "Reserved".to_string(), "Res.".to_string())
                }
            };
            v.emit_bytes(pos - 2, pos, AnnotationCategory::Data, &[&long, &short]);
            Some(pos)
        }
        0b00010 => {
            if dec_addr != 0 {
                v.emit_bytes(
                    0,
                    v.len() - 2,
                    AnnotationCategory::Error,
                    &["Only Broadcast allowed", "Error", "E"],
                );
            }
            if v.len() == 5 || v.len() == 6 {
                v.emit_byte(pos - 1, AnnotationCategory::Data, &["Systemtime"]);
            }
            if v.len() == 7 || v.len() == 8 {
                v.emit_byte(pos - 1, AnnotationCategory::Data, &["Systemtime (deprecated)"]);
            }
            v.emit_byte(pos, AnnotationCategory::Command, &["MMMMMMMM"]);
            let mut value = u64::from(v.value(pos));
            let pos = v.advance(pos)?;
            v.emit_byte(pos, AnnotationCategory::Command, &["MMMMMMMM"]);
            value = value * 256 + u64::from(v.value(pos));
            if v.len() == 5 || v.len() == 6 {
                let long = format!(
                    "{} ms since systemstart ({:.0} seconds)",
                    value,
                    value as f64 / 1000.0
                );
                let mid = format!("{} ms since systemstart", value);
                let short = value.to_string();
                v.emit_bytes(pos - 1, pos, AnnotationCategory::Data, &[&long, &mid, &short]);
                return Some(pos);
            }
            if v.len() == 7 || v.len() == 8 {
                let mut pos = pos;
                for _ in 0..2 {
                    pos = v.advance(pos)?;
                    v.emit_byte(pos, AnnotationCategory::Command, &["MMMMMMMM"]);
                    value = value * 256 + u64::from(v.value(pos));
                }
                let long = format!(
                    "{} ms since systemstart ({:.0} minutes = {:.1} hours)",
                    value,
                    value as f64 / 60000.0,
                    value as f64 / 3_600_000.0
                );
                let mid = format!("{} ms since systemstart", value);
                let short = value.to_string();
                v.emit_bytes(pos - 3, pos, AnnotationCategory::Data, &[&long, &mid, &short]);
                return Some(pos);
            }
            Some(pos)
        }
        _ => {
            v.emit_byte(pos, AnnotationCategory::Command, &["Reserved"]);
            Some(pos)
        }
    }
}

fn cv_access(v: &mut PacketView<'_>, pos: usize, subcmd: u8) -> Option<usize> {
    if subcmd & 0b10000 != 0 {
        // short form
        v.emit_byte(
            pos,
            AnnotationCategory::Command,
            &[
                "Configuration Variable Access Instruction - Short Form",
                "CV Access Instruction short",
                "CV short",
            ],
        );
        return match subcmd & 0b1111 {
            0b0000 => {
                v.emit_byte(pos, AnnotationCategory::Data, &["Not available for use", "Not av."]);
                Some(pos)
            }
            0b0010 => {
                v.emit_byte(pos, AnnotationCategory::Data, &["Acceleration Value (CV#23)", "CV#23"]);
                single_value(v, pos, "Data")
            }
            0b0011 => {
                v.emit_byte(pos, AnnotationCategory::Data, &["Deceleration Value (CV#24)", "CV#24"]);
                single_value(v, pos, "Data")
            }
            0b0100 => {
                v.emit_byte(pos, AnnotationCategory::Data, &["Write CV#17 + CV#18", "w CV#17+18"]);
                let pos = single_value(v, pos, "CV17")?;
                single_value(v, pos, "CV18")
            }
            0b0101 => {
                v.emit_byte(pos, AnnotationCategory::Data, &["Write CV#31 + CV#32", "w CV#31+32"]);
                let pos = single_value(v, pos, "CV31")?;
                single_value(v, pos, "CV32")
            }
            0b1001 => {
                v.emit_byte(
                    pos,
                    AnnotationCategory::Data,
                    &[
                        "Reserved (outdated: Service Mode Decoder Lock Instruction)",
                        "Res. (old: Dec. Lock)",
                        "Res.",
                    ],
                );
                let pos = v.advance(pos)?;
                let label = (v.value(pos) & 0b0111_1111).to_string();
                v.emit_byte(pos, AnnotationCategory::Data, &[&label]);
                v.emit_byte(pos, AnnotationCategory::Command, &["Short address", "Addr."]);
                Some(pos)
            }
            _ => {
                v.emit_byte(
                    pos,
                    AnnotationCategory::Data,
                    &["Reserved (maybe service mode packet)", "Reserved", "Res."],
                );
                Some(pos)
            }
        };
    }

    let long_form = (pos == 1 && v.len() == 5) || (pos == 2 && v.len() == 6);
    let xpom_form = (pos == 1 && v.len() >= 6) || (pos == 2 && v.len() >= 7);

    if long_form {
        v.emit_byte(
            pos,
            AnnotationCategory::Command,
            &[
                "Configuration Variable Access Instruction - Long Form (POM)",
                "CV Access Instruction long (POM)",
                "CV long (POM)",
            ],
        );
        let mode = (subcmd >> 2) & 0b11;
        if ![0b01, 0b11, 0b10].contains(&mode) {
            v.emit_byte(pos, AnnotationCategory::Data, &["Reserved for future use", "Res."]);
            return Some(pos);
        }
        let (long, short) = match mode {
            0b01 => ("Read/Verify byte", "r/v"),
            0b11 => ("Write byte", "w"),
            _ => ("Bit manipulation", "Bit"),
        };
        v.emit_byte(pos, AnnotationCategory::Data, &[long, short]);
        let pos = v.advance(pos)?;
        let cv = (u32::from(v.value(pos - 1)) & 0b11) * 256 + u32::from(v.value(pos)) + 1;
        v.out.cv = Some(cv);
        let label = cv.to_string();
        v.emit_byte(pos, AnnotationCategory::DataCv, &[&label]);
        v.emit_byte(pos, AnnotationCategory::Command, &["CV"]);
        let pos = v.advance(pos)?;
        if mode != 0b10 {
            let label = v.value(pos).to_string();
            v.emit_byte(pos, AnnotationCategory::Data, &[&label]);
            v.emit_byte(pos, AnnotationCategory::Command, &["Value"]);
        } else {
            annotate_bit_manipulation(v, pos);
        }
        return Some(pos);
    }

    if xpom_form {
        v.emit_byte(pos, AnnotationCategory::Command, &["XPOM"]);
        let mode = (subcmd >> 2) & 0b11;
        if ![0b01, 0b11, 0b10].contains(&mode) {
            v.emit_byte(pos, AnnotationCategory::Data, &["Reserved for future use", "Res."]);
            return Some(pos);
        }
        let (mut long, mut short) = match mode {
            0b01 => ("Read bytes".to_string(), "r".to_string()),
            0b11 => ("Write byte(s)".to_string(), "w".to_string()),
            _ => ("Bit write".to_string(), "bit".to_string()),
        };
        long.push_str(&format!(", SS:{}", v.value(pos) & 0b11));
        short.push_str(&format!(",SS:{}", v.value(pos) & 0b11));
        v.emit_byte(pos, AnnotationCategory::Data, &[&long, &short]);
        let mut pos = pos;
        for _ in 0..3 {
            pos = v.advance(pos)?;
        }
        let cv = (u32::from(v.value(pos - 2)) * 256 + u32::from(v.value(pos - 1))) * 256
            + u32::from(v.value(pos))
            + 1;
        v.out.cv = Some(cv);
        let label = cv.to_string();
        v.emit_bytes(pos - 2, pos, AnnotationCategory::DataCv, &[&label]);
        v.emit_bytes(pos - 2, pos, AnnotationCategory::Command, &["CV"]);
        if mode == 0b01 {
            // read carries no data bytes
            return Some(pos);
        }
        pos = v.advance(pos)?;
        if mode == 0b10 && v.value(pos) >> 4 == 0b1111 {
            let byte = v.value(pos);
            let mut label = (byte & 0b0000_0111).to_string();
            if byte & 0b1000 != 0 {
                label.push_str(", 1");
            } else {
                label.push_str(", 0");
            }
            let short = label.replace(", ", ",");
            v.emit_byte(pos, AnnotationCategory::Data, &[&label, &short]);
            v.emit_byte(
                pos,
                AnnotationCategory::Command,
                &["Position, Value", "Pos, Value", "P,V"],
            );
        } else if mode == 0b11 {
            let caption = "Data-1".to_string();
            v.emit_byte(pos, AnnotationCategory::Command, &[&caption]);
            let label = v.value(pos).to_string();
            v.emit_byte(pos, AnnotationCategory::Data, &[&label]);
            for n in 2..=4 {
                if v.len() > pos + 2 {
                    pos = v.advance(pos)?;
                    let caption = format!("Data-{}", n);
                    v.emit_byte(pos, AnnotationCategory::Command, &[&caption]);
                    let label = v.value(pos).to_string();
                    v.emit_byte(pos, AnnotationCategory::Data, &[&label]);
                }
            }
        }
        return Some(pos);
    }

    Some(pos)
}

/// Consume one byte, annotating its decimal value under the given caption
fn single_value(v: &mut PacketView<'_>, pos: usize, caption: &str) -> Option<usize> {
    let pos = v.advance(pos)?;
    let label = v.value(pos).to_string();
    v.emit_byte(pos, AnnotationCategory::Data, &[&label]);
    v.emit_byte(pos, AnnotationCategory::Command, &[caption]);
    Some(pos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DecoderConfig;
    use crate::core::{ByteRecord, Packet};
    use crate::packet::{DecodeOutcome, PacketDecoder};
    use crate::timing::TimingMode;

    fn packet_of(values: &[u8]) -> Packet {
        let mut bytes = Vec::new();
        for (i, &value) in values.iter().enumerate() {
            let base = i as u64 * 900;
            let mut spans = [0u64; 9];
            for (bit, s) in spans.iter_mut().enumerate() {
                *s = base + bit as u64 * 100;
            }
            bytes.push(ByteRecord::new(value, spans));
        }
        Packet::new(bytes)
    }

    fn decode(values: &[u8], speed_steps: SpeedSteps) -> DecodeOutcome {
        let mut with_checksum = values.to_vec();
        with_checksum.push(values.iter().fold(0, |acc, v| acc ^ v));
        let mut config = DecoderConfig::new(TimingMode::NmraDecoding);
        config.speed_steps = speed_steps;
        PacketDecoder::new(&config).decode(&packet_of(&with_checksum))
    }

    fn data_labels(out: &DecodeOutcome) -> Vec<String> {
        out.annotations
            .iter()
            .filter(|a| a.category == AnnotationCategory::Data)
            .flat_map(|a| a.labels.clone())
            .collect()
    }

    #[test]
    fn test_basic_speed_28_step() {
        // address 3, cmd 011 (forward), speed code 4, bit5 set
        let out = decode(&[3, 0b0111_0100], SpeedSteps::Mode28To128);
        assert!(out.command_labels.iter().any(|l| l == "Speed 28"));
        // speed = ((4-1)*2 - 1) + 1 = 6
        assert!(data_labels(&out).iter().any(|l| l == "Forward Speed: 6 / 28"));
    }

    #[test]
    fn test_basic_speed_14_step_reports_f0() {
        let out = decode(&[3, 0b0111_0100], SpeedSteps::Mode14);
        assert!(out.command_labels.iter().any(|l| l == "Speed 14"));
        assert!(data_labels(&out)
            .iter()
            .any(|l| l == "Forward Speed: 3 / 14, F0=1"));
    }

    #[test]
    fn test_broadcast_stop() {
        let out = decode(&[0, 0b0110_0000], SpeedSteps::Mode28To128);
        assert_eq!(out.decoder_address, Some(0));
        assert!(data_labels(&out).iter().any(|l| l == "STOP (Broadcast)"));
    }

    #[test]
    fn test_128_speed_step() {
        // subcmd 11111, then 0b10000101: forward, speed 4
        let out = decode(&[3, 0b0011_1111, 0b1000_0101], SpeedSteps::Mode28To128);
        assert!(out.command_labels.iter().any(|l| l == "128 Speed Step"));
        assert!(data_labels(&out).iter().any(|l| l == "Forward Speed: 4 / 126"));

        let out = decode(&[3, 0b0011_1111, 0b1000_0001], SpeedSteps::Mode28To128);
        assert!(data_labels(&out)
            .iter()
            .any(|l| l == "EMERGENCY STOP (HALT) (Forward)"));
    }

    #[test]
    fn test_function_group_one() {
        // F0 on, F1 and F3 on
        let out = decode(&[3, 0b1001_0101], SpeedSteps::Mode28To128);
        assert!(out.command_labels.iter().any(|l| l == "FG1"));
        assert!(data_labels(&out)
            .iter()
            .any(|l| l == "F0:1, F1:1, F2:0, F3:1, F4:0"));
    }

    #[test]
    fn test_function_group_two_f5_and_f9() {
        let out = decode(&[3, 0b1011_0001], SpeedSteps::Mode28To128);
        assert!(data_labels(&out)
            .iter()
            .any(|l| l == "F5:1, F6:0, F7:0, F8:0"));

        let out = decode(&[3, 0b1010_0001], SpeedSteps::Mode28To128);
        assert!(data_labels(&out)
            .iter()
            .any(|l| l == "F9:1, F10:0, F11:0, F12:0"));
    }

    #[test]
    fn test_future_expansion_f13_group() {
        let out = decode(&[3, 0b1101_1110, 0b0000_0011], SpeedSteps::Mode28To128);
        assert!(out
            .command_labels
            .iter()
            .any(|l| l == "Future Expansion Instruction"));
        assert!(data_labels(&out)
            .iter()
            .any(|l| l.starts_with("F13:1, F14:1, F15:0")));
    }

    #[test]
    fn test_cv_long_form_write() {
        // 1110CCVV VVVVVVVV DDDDDDDD: write (CC=11), CV high 01, low 4 -> CV 261
        let out = decode(&[3, 0b1110_1101, 4, 42], SpeedSteps::Mode28To128);
        assert_eq!(out.cv, Some(261));
        assert!(out.command_labels.iter().any(|l| l == "CV long (POM)"));
        assert!(data_labels(&out).iter().any(|l| l == "42"));
    }

    #[test]
    fn test_xpom_write_cv24() {
        // XPOM write, SS=0, 24 bit CV 0x000102 -> 259, one data byte
        let out = decode(
            &[3, 0b1110_1100, 0x00, 0x01, 0x02, 99],
            SpeedSteps::Mode28To128,
        );
        assert_eq!(out.cv, Some(259));
        assert!(out.command_labels.iter().any(|l| l == "XPOM"));
        assert!(out.command_labels.iter().any(|l| l == "Data-1"));
    }

    #[test]
    fn test_binary_state_long_zero_low_bits_is_error() {
        let out = decode(&[3, 0b1100_0000, 0b1000_0000, 2], SpeedSteps::Mode28To128);
        assert!(out
            .annotations
            .iter()
            .any(|a| a.category == AnnotationCategory::Error
                && a.labels[0] == "Use binarystate short"));
    }

    #[test]
    fn test_model_time_broadcast() {
        // 00MMMMMM=5 minutes, WWWHHHHH=Tuesday 13h, U0BBBBBB=update+acc 3
        let out = decode(
            &[0, 0b1100_0001, 0b0000_0101, 0b0010_1101, 0b1000_0011],
            SpeedSteps::Mode28To128,
        );
        assert!(data_labels(&out)
            .iter()
            .any(|l| l == "Tuesday 13:05 hrs, Update:1, Acceleration:3"));
        assert!(!out
            .annotations
            .iter()
            .any(|a| a.category == AnnotationCategory::Error
                && a.labels[0] == "Only Broadcast allowed"));
    }

    #[test]
    fn test_model_time_requires_broadcast() {
        let out = decode(
            &[3, 0b1100_0001, 0b0000_0101, 0b0010_1101, 0b1000_0011],
            SpeedSteps::Mode28To128,
        );
        assert!(out
            .annotations
            .iter()
            .any(|a| a.labels[0] == "Only Broadcast allowed"));
    }

    #[test]
    fn test_systemtime_two_byte_form() {
        let out = decode(&[0, 0b1100_0010, 0x01, 0xF4], SpeedSteps::Mode28To128);
        assert!(data_labels(&out)
            .iter()
            .any(|l| l == "500 ms since systemstart (0 seconds)"));
    }

    #[test]
    fn test_consist_control_set_address() {
        let out = decode(&[3, 0b0001_0010, 0b0000_0101], SpeedSteps::Mode28To128);
        assert!(out.command_labels.iter().any(|l| l == "Consist Control"));
        assert!(data_labels(&out).iter().any(|l| l == "5, dir:normal"));
    }

    #[test]
    fn test_decoder_reset() {
        let out = decode(&[3, 0b0000_0000], SpeedSteps::Mode28To128);
        assert!(out.command_labels.iter().any(|l| l == "Decoder Reset"));
    }
}
