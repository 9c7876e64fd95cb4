//! Socket-layer scenarios against a scripted UART.

use core::cell::RefCell;

use embassy_futures::block_on;
use sara_net::at::uart::FakeUart;
use sara_net::error::Error;
use sara_net::sara::NoLed;
use sara_net::sara::modem::SaraModem;
use sara_net::sara::socket::TcpSocket;

type TestModem<'a> = SaraModem<&'a RefCell<FakeUart>, &'a RefCell<FakeUart>, NoLed>;

fn modem(fake: &RefCell<FakeUart>) -> TestModem<'_> {
    SaraModem::new(fake, fake, NoLed)
}

static PAYLOAD: [u8; 2500] = [0x41; 2500];

#[test]
fn create_and_connect() {
    let fake = RefCell::new(FakeUart::new(&[
        (b"AT+USOCR=6\r\n".as_slice(), b"\r\n+USOCR: 3\r\nOK\r\n".as_slice()),
        (
            b"AT+USOCO=3,\"harvest-files.soracom.io\",80\r\n".as_slice(),
            b"\r\nOK\r\n".as_slice(),
        ),
    ]));
    let mut modem = modem(&fake);

    block_on(async {
        let sock = modem.socket_create().await.unwrap();
        assert_eq!(sock, 3);
        modem.socket_connect(sock, "harvest-files.soracom.io", 80).await.unwrap();
        assert_eq!(modem.active_socket(), Some(3));
    });
    assert!(fake.borrow().all_consumed());
}

#[test]
fn send_recovers_from_partial_and_zero_writes() {
    let fake = RefCell::new(FakeUart::new(&[
        (b"AT+USOCR=6\r\n".as_slice(), b"\r\n+USOCR: 0\r\nOK\r\n".as_slice()),
        (b"AT+USOCO=0,\"h\",80\r\n".as_slice(), b"\r\nOK\r\n".as_slice()),
        // 2500 bytes go out in three USOWR iterations: 1000, 0, 1500.
        (b"AT+USOWR=0,2500\r\n".as_slice(), b"@".as_slice()),
        (&PAYLOAD, b"\r\n+USOWR: 0,1000\r\nOK\r\n".as_slice()),
        (b"AT+USOWR=0,1500\r\n".as_slice(), b"@".as_slice()),
        (&PAYLOAD[1000..], b"\r\n+USOWR: 0,0\r\nOK\r\n".as_slice()),
        (b"AT+USOWR=0,1500\r\n".as_slice(), b"@".as_slice()),
        (&PAYLOAD[1000..], b"\r\n+USOWR: 0,1500\r\nOK\r\n".as_slice()),
    ]));
    let mut modem = modem(&fake);

    block_on(async {
        let sock = modem.socket_create().await.unwrap();
        modem.socket_connect(sock, "h", 80).await.unwrap();
        let sent = modem.socket_send(sock, &PAYLOAD).await.unwrap();
        assert_eq!(sent, 2500);
    });
    assert!(fake.borrow().all_consumed());
}

#[test]
fn send_on_unconnected_socket_is_rejected() {
    let fake = RefCell::new(FakeUart::new(&[]));
    let mut modem = modem(&fake);
    let err = block_on(modem.socket_send(0, b"hello")).unwrap_err();
    assert_eq!(err, Error::SocketClosedError);
}

#[test]
fn recv_preserves_crlf_inside_payload() {
    let fake = RefCell::new(FakeUart::new(&[
        (b"AT+USOCR=6\r\n".as_slice(), b"\r\n+USOCR: 0\r\nOK\r\n".as_slice()),
        (b"AT+USOCO=0,\"h\",80\r\n".as_slice(), b"\r\nOK\r\n".as_slice()),
        (
            b"AT+USORD=0,5\r\n".as_slice(),
            b"\r\n+USORD: 0,5,\"a\r\nbc\"\r\nOK\r\n".as_slice(),
        ),
    ]));
    let mut modem = modem(&fake);

    block_on(async {
        let sock = modem.socket_create().await.unwrap();
        modem.socket_connect(sock, "h", 80).await.unwrap();
        fake.borrow_mut().inject(b"\r\n+UUSORD: 0,5\r\n");

        let mut buf = [0u8; 16];
        let read = modem.socket_recv(sock, &mut buf).await.unwrap();
        assert_eq!(&buf[..read], b"a\r\nbc");
    });
    assert!(fake.borrow().all_consumed());
}

#[test]
fn recv_pops_at_most_the_requested_size() {
    let fake = RefCell::new(FakeUart::new(&[
        (b"AT+USOCR=6\r\n".as_slice(), b"\r\n+USOCR: 0\r\nOK\r\n".as_slice()),
        (b"AT+USOCO=0,\"h\",80\r\n".as_slice(), b"\r\nOK\r\n".as_slice()),
        (
            b"AT+USORD=0,5\r\n".as_slice(),
            b"\r\n+USORD: 0,5,\"hello\"\r\nOK\r\n".as_slice(),
        ),
    ]));
    let mut modem = modem(&fake);

    block_on(async {
        let sock = modem.socket_create().await.unwrap();
        modem.socket_connect(sock, "h", 80).await.unwrap();
        fake.borrow_mut().inject(b"\r\n+UUSORD: 0,5\r\n");

        let mut buf = [0u8; 3];
        assert_eq!(modem.socket_recv(sock, &mut buf).await.unwrap(), 3);
        assert_eq!(&buf, b"hel");
        assert_eq!(modem.rx_available(), 2);
        // The remainder comes straight from the local buffer.
        assert_eq!(modem.socket_recv(sock, &mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"lo");
    });
}

#[test]
fn zero_length_uusord_issues_no_read() {
    let fake = RefCell::new(FakeUart::new(&[
        (b"AT+USOCR=6\r\n".as_slice(), b"\r\n+USOCR: 0\r\nOK\r\n".as_slice()),
        (b"AT+USOCO=0,\"h\",80\r\n".as_slice(), b"\r\nOK\r\n".as_slice()),
    ]));
    let mut modem = modem(&fake);

    block_on(async {
        let sock = modem.socket_create().await.unwrap();
        modem.socket_connect(sock, "h", 80).await.unwrap();
        fake.borrow_mut().inject(b"\r\n+UUSORD: 0,0\r\n");

        let mut buf = [0u8; 16];
        assert_eq!(modem.socket_recv(sock, &mut buf).await.unwrap(), 0);
    });
    // No AT+USORD went out: the script would have rejected the write.
    assert!(fake.borrow().all_consumed());
}

#[test]
fn early_uusocl_with_ok_tears_the_socket_down() {
    let fake = RefCell::new(FakeUart::new(&[
        (b"AT+USOCR=6\r\n".as_slice(), b"\r\n+USOCR: 0\r\nOK\r\n".as_slice()),
        (
            b"AT+USOCO=0,\"h\",80\r\n".as_slice(),
            b"\r\n+UUSOCL: 0\r\nOK\r\n".as_slice(),
        ),
        (b"AT+USOCL=0\r\n".as_slice(), b"\r\nOK\r\n".as_slice()),
    ]));
    let mut modem = modem(&fake);

    block_on(async {
        let sock = modem.socket_create().await.unwrap();
        assert_eq!(modem.socket_connect_step(sock, "h", 80).await, Ok(false));
        let err = loop {
            match modem.socket_connect_step(sock, "h", 80).await {
                Ok(false) => {}
                Ok(true) => panic!("connect must not succeed"),
                Err(err) => break err,
            }
        };
        assert_eq!(err, Error::SocketClosedError);
        assert_eq!(modem.active_socket(), None);
    });
    assert!(fake.borrow().all_consumed());
}

#[test]
fn early_uusocl_without_ok_is_caught_while_pending() {
    let fake = RefCell::new(FakeUart::new(&[
        (b"AT+USOCR=6\r\n".as_slice(), b"\r\n+USOCR: 0\r\nOK\r\n".as_slice()),
        (
            b"AT+USOCO=0,\"h\",80\r\n".as_slice(),
            b"\r\n+UUSOCL: 0\r\n".as_slice(),
        ),
        (b"AT+USOCL=0\r\n".as_slice(), b"\r\nOK\r\n".as_slice()),
    ]));
    let mut modem = modem(&fake);

    block_on(async {
        let sock = modem.socket_create().await.unwrap();
        assert_eq!(modem.socket_connect_step(sock, "h", 80).await, Ok(false));
        // First probe accumulates the URC, second one acts on it.
        assert_eq!(modem.socket_connect_step(sock, "h", 80).await, Ok(false));
        let err = modem.socket_connect_step(sock, "h", 80).await.unwrap_err();
        assert_eq!(err, Error::SocketClosedError);
        assert_eq!(modem.active_socket(), None);
    });
    assert!(fake.borrow().all_consumed());
}

#[test]
fn close_is_idempotent_and_clears_the_rx_buffer() {
    let fake = RefCell::new(FakeUart::new(&[
        (b"AT+USOCR=6\r\n".as_slice(), b"\r\n+USOCR: 0\r\nOK\r\n".as_slice()),
        (b"AT+USOCO=0,\"h\",80\r\n".as_slice(), b"\r\nOK\r\n".as_slice()),
        (
            b"AT+USORD=0,5\r\n".as_slice(),
            b"\r\n+USORD: 0,5,\"hello\"\r\nOK\r\n".as_slice(),
        ),
        (b"AT+USOCL=0\r\n".as_slice(), b"\r\nOK\r\n".as_slice()),
        // A second close is answered with an error and swallowed.
        (b"AT+USOCL=0\r\n".as_slice(), b"\r\nERROR\r\n".as_slice()),
    ]));
    let mut modem = modem(&fake);

    block_on(async {
        let sock = modem.socket_create().await.unwrap();
        modem.socket_connect(sock, "h", 80).await.unwrap();
        fake.borrow_mut().inject(b"\r\n+UUSORD: 0,5\r\n");

        let mut buf = [0u8; 2];
        assert_eq!(modem.socket_recv(sock, &mut buf).await.unwrap(), 2);
        assert!(modem.rx_available() > 0);

        modem.socket_close(sock).await.unwrap();
        assert_eq!(modem.active_socket(), None);
        assert_eq!(modem.rx_available(), 0);
        // Closed socket: recv returns empty without touching the modem.
        assert_eq!(modem.socket_recv(sock, &mut buf).await.unwrap(), 0);

        modem.socket_close(sock).await.unwrap();
    });
    assert!(fake.borrow().all_consumed());
}
