//! LAN-side probe for a running BacProp gateway.
//!
//! Broadcasts a Who-Is, prints every I-Am heard within the listen window
//! (including the routed network/address each device answers from), and can
//! read properties from one discovered device through the gateway's router.
//!
//! Usage:
//!   bacprop-probe [--target IP] [--range LO HI] [--read DEVICE AV-INSTANCE]
//!                 [--timeout SECS]

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::process::ExitCode;
use std::time::{Duration, Instant};

use bacprop::bacnet::BACNET_IP_PORT;
use bacprop::bacnet::apdu::{Apdu, MaxApduSize, MaxSegments};
use bacprop::bacnet::bvll::{self, BvllPdu};
use bacprop::bacnet::encoding;
use bacprop::bacnet::npdu::{GLOBAL_BROADCAST_NETWORK, NetworkAddress, Npdu};
use bacprop::bacnet::object::{ObjectIdentifier, ObjectType, PropertyIdentifier};
use bacprop::bacnet::services::{
    ConfirmedServiceChoice, IAmRequest, ReadPropertyAck, ReadPropertyRequest,
    UnconfirmedServiceChoice, WhoIsRequest,
};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

struct Args {
    target: SocketAddrV4,
    range: Option<(u32, u32)>,
    read: Option<(u32, u32)>,
    timeout: Duration,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            target: SocketAddrV4::new(Ipv4Addr::BROADCAST, BACNET_IP_PORT),
            range: None,
            read: None,
            timeout: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone)]
struct Discovered {
    announce: IAmRequest,
    /// Routed source (SNET/SADR) when the device sits behind a router.
    routed_source: Option<NetworkAddress>,
    endpoint: SocketAddrV4,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{message}");
            eprintln!(
                "usage: bacprop-probe [--target IP] [--range LO HI] \
                 [--read DEVICE AV-INSTANCE] [--timeout SECS]"
            );
            return ExitCode::from(2);
        }
    };

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("probe failed: {error}");
            ExitCode::FAILURE
        }
    }
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args::default();
    let mut iter = std::env::args().skip(1);
    while let Some(flag) = iter.next() {
        let mut next = |name: &str| {
            iter.next().ok_or_else(|| format!("{name} needs a value"))
        };
        match flag.as_str() {
            "--target" => {
                let ip: Ipv4Addr = next("--target")?
                    .parse()
                    .map_err(|_| "bad --target address".to_string())?;
                args.target = SocketAddrV4::new(ip, BACNET_IP_PORT);
            }
            "--range" => {
                let low = parse_u32(&next("--range")?)?;
                let high = parse_u32(&next("--range")?)?;
                args.range = Some((low, high));
            }
            "--read" => {
                let device = parse_u32(&next("--read")?)?;
                let object = parse_u32(&next("--read")?)?;
                args.read = Some((device, object));
            }
            "--timeout" => {
                args.timeout = Duration::from_secs(parse_u32(&next("--timeout")?)? as u64);
            }
            other => return Err(format!("unknown flag {other}")),
        }
    }
    Ok(args)
}

fn parse_u32(text: &str) -> Result<u32, String> {
    text.parse().map_err(|_| format!("bad number {text:?}"))
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.set_broadcast(true)?;
    socket.set_read_timeout(Some(Duration::from_millis(250)))?;

    send_who_is(&socket, args)?;

    let devices = collect_i_ams(&socket, args.timeout);
    if devices.is_empty() {
        println!("no devices answered within {:?}", args.timeout);
    }
    for device in &devices {
        let route = match &device.routed_source {
            Some(source) => format!(
                " (network {}, address {})",
                source.network,
                source
                    .address
                    .iter()
                    .map(|byte| byte.to_string())
                    .collect::<Vec<_>>()
                    .join(".")
            ),
            None => String::new(),
        };
        println!(
            "device {} at {}{}: vendor {}, max-apdu {}, segmentation {}",
            device.announce.device_identifier.instance,
            device.endpoint,
            route,
            device.announce.vendor_identifier,
            device.announce.max_apdu_length_accepted,
            device.announce.segmentation_supported,
        );
    }

    if let Some((device_instance, object_instance)) = args.read {
        let Some(device) = devices
            .iter()
            .find(|d| d.announce.device_identifier.instance == device_instance)
        else {
            return Err(format!("device {device_instance} did not answer Who-Is").into());
        };
        let object = ObjectIdentifier::new(ObjectType::AnalogValue, object_instance);
        let value = read_property(
            &socket,
            device,
            object,
            PropertyIdentifier::PresentValue as u32,
            1,
        )?;
        let (present_value, _) = encoding::decode_real(&value)?;
        let name = read_property(
            &socket,
            device,
            object,
            PropertyIdentifier::ObjectName as u32,
            2,
        )?;
        let (object_name, _) = encoding::decode_character_string(&name)?;
        println!(
            "device {device_instance} analog-value {object_instance}: \
             {object_name} = {present_value}"
        );
    }
    Ok(())
}

fn send_who_is(socket: &UdpSocket, args: &Args) -> std::io::Result<()> {
    let request = match args.range {
        Some((low, high)) => WhoIsRequest::for_range(low, high),
        None => WhoIsRequest::all(),
    };
    let mut payload = Vec::new();
    request.encode(&mut payload).expect("who-is encoding");
    let apdu = Apdu::UnconfirmedRequest {
        service_choice: UnconfirmedServiceChoice::WhoIs as u8,
        service_data: payload,
    };
    let mut npdu = Npdu::remote(
        NetworkAddress::broadcast(GLOBAL_BROADCAST_NETWORK),
        false,
    )
    .encode();
    npdu.extend_from_slice(&apdu.encode());
    socket
        .send_to(&bvll::encode_broadcast(&npdu), args.target)
        .map(|_| ())
}

fn collect_i_ams(socket: &UdpSocket, timeout: Duration) -> Vec<Discovered> {
    let deadline = Instant::now() + timeout;
    let mut devices: Vec<Discovered> = Vec::new();
    let mut buffer = [0u8; 1500];
    while Instant::now() < deadline {
        let Some((frame, endpoint)) = recv_frame(socket, &mut buffer) else {
            continue;
        };
        let Some((header, apdu)) = unwrap_npdu(&frame) else {
            continue;
        };
        let Apdu::UnconfirmedRequest {
            service_choice,
            service_data,
        } = apdu
        else {
            continue;
        };
        if service_choice != UnconfirmedServiceChoice::IAm as u8 {
            continue;
        }
        match IAmRequest::decode(&service_data) {
            Ok(announce) => {
                let instance = announce.device_identifier.instance;
                if !devices
                    .iter()
                    .any(|d| d.announce.device_identifier.instance == instance)
                {
                    devices.push(Discovered {
                        announce,
                        routed_source: header.source,
                        endpoint,
                    });
                }
            }
            Err(error) => warn!(%error, "undecodable I-Am"),
        }
    }
    devices
}

fn read_property(
    socket: &UdpSocket,
    device: &Discovered,
    object: ObjectIdentifier,
    property: u32,
    invoke_id: u8,
) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let request = ReadPropertyRequest::new(object, property);
    let mut payload = Vec::new();
    request.encode(&mut payload)?;
    let apdu = Apdu::ConfirmedRequest {
        segmented: false,
        more_follows: false,
        segmented_response_accepted: true,
        max_segments: MaxSegments::Unspecified,
        max_response_size: MaxApduSize::Up1476,
        invoke_id,
        sequence_number: None,
        proposed_window_size: None,
        service_choice: ConfirmedServiceChoice::ReadProperty as u8,
        service_data: payload,
    };
    let header = match &device.routed_source {
        Some(source) => Npdu::remote(source.clone(), true),
        None => Npdu::local(true),
    };
    let mut npdu = header.encode();
    npdu.extend_from_slice(&apdu.encode());
    socket.send_to(&bvll::encode_unicast(&npdu), device.endpoint)?;

    let deadline = Instant::now() + Duration::from_secs(3);
    let mut buffer = [0u8; 1500];
    while Instant::now() < deadline {
        let Some((frame, _)) = recv_frame(socket, &mut buffer) else {
            continue;
        };
        let Some((_, apdu)) = unwrap_npdu(&frame) else {
            continue;
        };
        match apdu {
            Apdu::ComplexAck {
                invoke_id: got,
                service_data,
                segmented: false,
                ..
            } if got == invoke_id => {
                let ack = ReadPropertyAck::decode(&service_data)?;
                return Ok(ack.property_value);
            }
            Apdu::Error {
                invoke_id: got,
                error_class,
                error_code,
                ..
            } if got == invoke_id => {
                return Err(
                    format!("read failed: class {error_class} code {error_code}").into(),
                );
            }
            other => debug!(apdu = ?other, "ignoring while waiting for ack"),
        }
    }
    Err("timed out waiting for ReadProperty ack".into())
}

fn recv_frame(socket: &UdpSocket, buffer: &mut [u8]) -> Option<(Vec<u8>, SocketAddrV4)> {
    match socket.recv_from(buffer) {
        Ok((len, SocketAddr::V4(endpoint))) => {
            match bvll::decode(&buffer[..len]) {
                Ok(
                    BvllPdu::OriginalUnicast { npdu } | BvllPdu::OriginalBroadcast { npdu },
                ) => Some((npdu, endpoint)),
                Ok(BvllPdu::Forwarded { npdu, origin }) => Some((npdu, origin)),
                Ok(other) => {
                    debug!(pdu = ?other, "ignoring BVLL frame");
                    None
                }
                Err(error) => {
                    debug!(%error, "undecodable frame");
                    None
                }
            }
        }
        _ => None,
    }
}

/// Split a frame into its NPDU header and APDU, skipping network messages.
fn unwrap_npdu(frame: &[u8]) -> Option<(Npdu, Apdu)> {
    let (header, consumed) = Npdu::decode(frame).ok()?;
    if header.is_network_message() {
        return None;
    }
    let apdu = Apdu::decode(&frame[consumed..]).ok()?;
    Some((header, apdu))
}
