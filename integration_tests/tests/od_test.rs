use std::sync::atomic::{AtomicBool, Ordering};

use canode_common::messages::{NmtCommand, NmtCommandSpecifier};
use canode_node::object_dict::{od_lock, ObjectAccess};
use integration_tests::object_dict::{NODE_ID, OBJECT2000, OBJECT2001, OBJECT6000};
use serial_test::serial;

mod utils;
use utils::{frames_with_id, setup};

const ITERATIONS: usize = 20_000;

#[test]
#[serial]
fn test_scalar_values_are_never_torn() {
    let _node = setup();
    let patterns = [0x1111_1111u32, 0xEEEE_EEEE];
    let done = AtomicBool::new(false);

    std::thread::scope(|s| {
        s.spawn(|| {
            for i in 0..ITERATIONS {
                OBJECT2000.write(0, &patterns[i % 2].to_le_bytes()).unwrap();
            }
            done.store(true, Ordering::Release);
        });
        for _ in 0..2 {
            s.spawn(|| {
                while !done.load(Ordering::Acquire) {
                    let value = OBJECT2000.read_u32(0).unwrap();
                    assert!(
                        value == patterns[0] || value == patterns[1] || value == 0x1234_5678,
                        "torn read 0x{value:08x}"
                    );
                }
            });
        }
    });
}

#[test]
#[serial]
fn test_byte_fields_are_never_torn() {
    let _node = setup();
    let done = AtomicBool::new(false);

    std::thread::scope(|s| {
        s.spawn(|| {
            for i in 0..ITERATIONS {
                let fill = if i % 2 == 0 { 0xA5 } else { 0x5A };
                OBJECT2001.write(0, &[fill; 200]).unwrap();
            }
            done.store(true, Ordering::Release);
        });
        s.spawn(|| {
            let mut buf = [0u8; 200];
            while !done.load(Ordering::Acquire) {
                assert_eq!(200, OBJECT2001.read(0, 0, &mut buf).unwrap());
                assert!(buf.iter().all(|b| *b == buf[0]), "torn read {buf:02x?}");
            }
        });
    });
}

#[test]
#[serial]
fn test_tpdo_sees_consistent_snapshot() {
    let mut node = setup();
    let mut device = node.device();
    let mut rx = node.bus.new_receiver();
    node.process(0);

    node.sdo_write(0x1A00, 0, &[0]).unwrap();
    node.sdo_write(0x1A00, 1, &0x6000_0108u32.to_le_bytes()).unwrap();
    node.sdo_write(0x1A00, 2, &0x6000_0208u32.to_le_bytes()).unwrap();
    node.sdo_write(0x1A00, 0, &[2]).unwrap();
    node.sdo_write(0x1800, 2, &[254]).unwrap();
    node.sdo_write(0x1800, 1, &(0x180 + NODE_ID as u32).to_le_bytes()).unwrap();
    device.send_now(NmtCommand { cmd: NmtCommandSpecifier::Start, node: 0 }.into());
    node.process(0);
    rx.drain();

    let done = AtomicBool::new(false);
    std::thread::scope(|s| {
        // Both inputs always change together
        s.spawn(|| {
            let mut n = 0u8;
            while !done.load(Ordering::Acquire) {
                n = n.wrapping_add(1);
                od_lock(|| {
                    OBJECT6000.write(1, &[n]).unwrap();
                    OBJECT6000.write(2, &[n]).unwrap();
                });
            }
        });

        for _ in 0..2000 {
            node.node.tpdo_request(0);
            node.process(100);
            for msg in frames_with_id(&rx.drain(), 0x180 + NODE_ID as u16) {
                let data = msg.data();
                assert_eq!(data[0], data[1], "inconsistent TPDO {data:02x?}");
            }
        }
        done.store(true, Ordering::Release);
    });
}
