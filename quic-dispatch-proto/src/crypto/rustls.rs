use std::{io, sync::Arc};

use rustls::quic::{Keys, Suite, Version};

use crate::{
    crypto::{CryptoError, UnsupportedVersion},
    packet::PacketNumber,
    shared::ConnectionId,
    Side,
};

impl From<Side> for rustls::Side {
    fn from(s: Side) -> Self {
        match s {
            Side::Client => Self::Client,
            Side::Server => Self::Server,
        }
    }
}

/// Find the Initial cipher suite (AES-128-GCM-SHA256) offered by `provider`
pub fn initial_suite_from_provider(
    provider: &Arc<rustls::crypto::CryptoProvider>,
) -> Option<Suite> {
    provider
        .cipher_suites
        .iter()
        .find_map(|cs| match (cs.suite(), cs.tls13()) {
            (rustls::CipherSuite::TLS13_AES_128_GCM_SHA256, Some(suite)) => {
                Some(suite.quic_suite())
            }
            _ => None,
        })
        .flatten()
}

/// The Initial cipher suite of the *ring* crypto provider
pub fn default_initial_suite() -> Option<Suite> {
    initial_suite_from_provider(&Arc::new(rustls::crypto::ring::default_provider()))
}

pub(crate) fn interpret_version(version: u32) -> Result<Version, UnsupportedVersion> {
    match version {
        0xff00_001d..=0xff00_0020 => Ok(Version::V1Draft),
        0x0000_0001 | 0xff00_0021..=0xff00_0022 => Ok(Version::V1),
        _ => Err(UnsupportedVersion),
    }
}

/// Initial packet protection for one connection attempt
///
/// Initial keys are derived from the destination connection ID of the client's first packet,
/// so anyone on the path can compute them. They protect against off-path tampering only.
pub struct InitialKeys {
    keys: Keys,
}

impl InitialKeys {
    /// Derive the keys `side` uses for a connection whose first client packet was sent to
    /// `dst_cid`
    pub fn new(
        suite: &Suite,
        version: u32,
        dst_cid: &ConnectionId,
        side: Side,
    ) -> Result<Self, UnsupportedVersion> {
        let version = interpret_version(version)?;
        Ok(Self {
            keys: suite.keys(dst_cid, side.into(), version),
        })
    }

    /// The length of the AEAD tag appended by [`seal`](Self::seal)
    pub fn tag_len(&self) -> usize {
        self.keys.local.packet.tag_len()
    }

    /// Encrypt the payload of `packet` in place, append the tag, and protect the header
    ///
    /// `packet` holds the plaintext header (`header_len` bytes, packet number at `pn_offset`)
    /// followed by the plaintext payload.
    pub fn seal(
        &self,
        pn: u64,
        packet: &mut Vec<u8>,
        pn_offset: usize,
        header_len: usize,
    ) -> Result<(), CryptoError> {
        let (header, payload) = packet.split_at_mut(header_len);
        let tag = self
            .keys
            .local
            .packet
            .encrypt_in_place(pn, &*header, payload)
            .map_err(|_| CryptoError)?;
        packet.extend_from_slice(tag.as_ref());

        let hp = &self.keys.local.header;
        let sample_len = hp.sample_len();
        if packet.len() < pn_offset + 4 + sample_len {
            return Err(CryptoError);
        }
        let (header, sample) = packet.split_at_mut(pn_offset + 4);
        let (first, rest) = header.split_at_mut(1);
        hp.encrypt_in_place(
            &sample[..sample_len],
            &mut first[0],
            &mut rest[pn_offset - 1..],
        )
        .map_err(|_| CryptoError)
    }

    /// Remove header and packet protection from a single packet sent by the peer
    ///
    /// Returns the full packet number and the plaintext payload.
    pub fn open<'a>(
        &self,
        packet: &'a mut [u8],
        pn_offset: usize,
        expected_pn: u64,
    ) -> Result<(u64, &'a [u8]), CryptoError> {
        let hp = &self.keys.remote.header;
        let sample_len = hp.sample_len();
        if pn_offset == 0 || packet.len() < pn_offset + 4 + sample_len {
            return Err(CryptoError);
        }
        {
            let (header, sample) = packet.split_at_mut(pn_offset + 4);
            let (first, rest) = header.split_at_mut(1);
            hp.decrypt_in_place(
                &sample[..sample_len],
                &mut first[0],
                &mut rest[pn_offset - 1..],
            )
            .map_err(|_| CryptoError)?;
        }

        let pn_len = (packet[0] & 0x03) as usize + 1;
        let pn = PacketNumber::decode(pn_len, &mut io::Cursor::new(&packet[pn_offset..]))
            .map_err(|_| CryptoError)?
            .expand(expected_pn);
        let (header, payload) = packet.split_at_mut(pn_offset + pn_len);
        let plain = self
            .keys
            .remote
            .packet
            .decrypt_in_place(pn, &*header, payload)
            .map_err(|_| CryptoError)?;
        Ok((pn, plain))
    }
}
