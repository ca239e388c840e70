//! Per-container network plumbing.
//!
//! Each container gets a veth pair: the host end is enslaved to the shared
//! `bridge0`, the peer end moves into a named network namespace where it is
//! given a deterministic MAC and `10.0.0.x/24` address plus a default route
//! via the bridge. Everything is done over rtnetlink; teardown deletes the
//! host end (the peer follows) and the namespace.
//!
//! Collaborator contract: the host must already have `bridge0` configured
//! with `10.0.0.1/24` and NAT towards external networks.

use std::net::{IpAddr, Ipv4Addr};
use std::os::fd::AsRawFd;
use std::path::PathBuf;

use futures::TryStreamExt;
use netlink_packet_core::{NLM_F_ACK, NLM_F_CREATE, NLM_F_EXCL, NLM_F_REQUEST, NetlinkMessage, NetlinkPayload};
use netlink_packet_route::RouteNetlinkMessage;
use netlink_packet_route::link::{InfoData, InfoKind, InfoVeth, LinkAttribute, LinkInfo, LinkMessage};
use nix::sched::CloneFlags;
use rtnetlink::{Handle, LinkUnspec, NetworkNamespace};

use crate::errors::{BockerError, BockerResult};
use crate::id;

/// The pre-existing host bridge all containers attach to.
pub const BRIDGE: &str = "bridge0";
/// Where named network namespaces are pinned.
pub const NETNS_DIR: &str = "/var/run/netns";

const GATEWAY: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const PREFIX_LEN: u8 = 24;

pub fn host_ifname(id: &str) -> String {
    format!("veth0_{id}")
}

pub fn peer_ifname(id: &str) -> String {
    format!("veth1_{id}")
}

pub fn netns_name(id: &str) -> String {
    format!("netns_{id}")
}

pub fn netns_path(id: &str) -> PathBuf {
    PathBuf::from(NETNS_DIR).join(netns_name(id))
}

/// Final address octet for a container id.
///
/// The whole numeric token maps bijectively onto 2..=254, so distinct
/// containers can never collide, and both 10.0.0.0 (reserved) and 10.0.0.1
/// (the gateway) are structurally unreachable.
pub fn address_suffix(id: &str) -> BockerResult<u8> {
    let n = id::numeric_token(id)
        .filter(|n| (id::ID_MIN..=id::ID_MAX).contains(n))
        .ok_or_else(|| {
            BockerError::NetworkSetup(format!("cannot derive an address from id '{id}'"))
        })?;
    Ok((n - (id::ID_MIN - 2)) as u8)
}

pub fn container_address(id: &str) -> BockerResult<Ipv4Addr> {
    Ok(Ipv4Addr::new(10, 0, 0, address_suffix(id)?))
}

pub fn container_mac(id: &str) -> BockerResult<[u8; 6]> {
    Ok([0x02, 0x42, 0xac, 0x11, 0x00, address_suffix(id)?])
}

/// Transient network artefacts owned by the launcher for one container.
#[derive(Debug)]
pub struct NetworkHandle {
    pub id: String,
    host_link: String,
    netns: String,
}

pub struct NetworkManager {
    bridge: String,
}

impl NetworkManager {
    pub fn new() -> Self {
        Self {
            bridge: BRIDGE.to_string(),
        }
    }

    /// Acquire the container's network: veth pair, bridge enslavement,
    /// namespace, interior configuration. If any step fails, everything
    /// acquired so far is released before the error returns.
    pub async fn setup(&self, id: &str) -> BockerResult<NetworkHandle> {
        let address = container_address(id)?;
        let mac = container_mac(id)?;
        let host = host_ifname(id);
        let peer = peer_ifname(id);
        let ns = netns_name(id);

        let (conn, handle, _) = rtnetlink::new_connection()
            .map_err(|e| BockerError::NetworkSetup(format!("netlink connection: {e}")))?;
        let conn_task = tokio::spawn(conn);

        let result = self
            .setup_with_handle(&handle, id, &host, &peer, &ns, address, mac)
            .await;
        conn_task.abort();
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn setup_with_handle(
        &self,
        handle: &Handle,
        id: &str,
        host: &str,
        peer: &str,
        ns: &str,
        address: Ipv4Addr,
        mac: [u8; 6],
    ) -> BockerResult<NetworkHandle> {
        let mut netns_created = false;

        // 1. veth pair; nothing to release if this fails.
        new_link(handle, veth_create_message(host, peer)).await?;

        let acquired = async {
            // 2. host end up, enslaved to the bridge.
            let bridge_index = link_index(handle, &self.bridge).await.map_err(|_| {
                BockerError::NetworkSetup(format!(
                    "bridge '{}' not found (host prerequisite)",
                    self.bridge
                ))
            })?;
            let host_index = link_index(handle, host).await?;
            handle
                .link()
                .set(LinkUnspec::new_with_index(host_index).up().build())
                .execute()
                .await
                .map_err(|e| BockerError::NetworkSetup(format!("bring up {host}: {e}")))?;
            set_link(handle, link_set_controller(host_index, bridge_index)).await?;

            // 3. dedicated namespace.
            NetworkNamespace::add(ns.to_string())
                .await
                .map_err(|e| BockerError::NetworkSetup(format!("create netns {ns}: {e}")))?;
            netns_created = true;

            // 4. move the peer end in.
            let peer_index = link_index(handle, peer).await?;
            let ns_file = std::fs::File::open(netns_path(id))
                .map_err(|e| BockerError::NetworkSetup(format!("open netns {ns}: {e}")))?;
            set_link(handle, link_set_netns(peer_index, ns_file.as_raw_fd())).await?;

            // 5. interior: lo, MAC, address, default route.
            configure_interior(InteriorSpec {
                netns_path: netns_path(id),
                ifname: peer.to_string(),
                mac,
                address,
                prefix_len: PREFIX_LEN,
                gateway: GATEWAY,
            })
            .await
        }
        .await;

        match acquired {
            Ok(()) => {
                tracing::debug!(container_id = %id, %address, "network ready");
                Ok(NetworkHandle {
                    id: id.to_string(),
                    host_link: host.to_string(),
                    netns: ns.to_string(),
                })
            }
            Err(e) => {
                if netns_created {
                    if let Err(del) = NetworkNamespace::del(ns.to_string()).await {
                        tracing::warn!(%ns, error = %del, "failed to release netns after setup failure");
                    }
                }
                if let Ok(index) = link_index(handle, host).await {
                    if let Err(del) = handle.link().del(index).execute().await {
                        tracing::warn!(%host, error = %del, "failed to release veth after setup failure");
                    }
                }
                Err(e)
            }
        }
    }

    /// Release a container's network artefacts: host veth (the peer follows
    /// automatically), then the namespace.
    pub async fn teardown(&self, handle: NetworkHandle) -> BockerResult<()> {
        let (conn, rt, _) = rtnetlink::new_connection()
            .map_err(|e| BockerError::NetworkSetup(format!("netlink connection: {e}")))?;
        let conn_task = tokio::spawn(conn);

        let result = async {
            if let Ok(index) = link_index(&rt, &handle.host_link).await {
                rt.link().del(index).execute().await.map_err(|e| {
                    BockerError::NetworkSetup(format!("delete {}: {e}", handle.host_link))
                })?;
            }
            NetworkNamespace::del(handle.netns.clone())
                .await
                .map_err(|e| {
                    BockerError::NetworkSetup(format!("delete netns {}: {e}", handle.netns))
                })?;
            Ok(())
        }
        .await;

        conn_task.abort();
        result
    }

    /// [`teardown`](Self::teardown), demoted to warnings. Used once the
    /// container has already run; a leak here must not fail the command.
    pub async fn teardown_best_effort(&self, handle: NetworkHandle) {
        let id = handle.id.clone();
        if let Err(e) = self.teardown(handle).await {
            tracing::warn!(container_id = %id, error = %e, "network teardown left artefacts behind");
        }
    }
}

impl Default for NetworkManager {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// NETLINK HELPERS
// ============================================================================

async fn link_index(handle: &Handle, name: &str) -> BockerResult<u32> {
    let mut links = handle.link().get().match_name(name.to_string()).execute();
    match links.try_next().await {
        Ok(Some(link)) => Ok(link.header.index),
        Ok(None) => Err(BockerError::NetworkSetup(format!("link '{name}' not found"))),
        Err(e) => Err(BockerError::NetworkSetup(format!(
            "link '{name}' lookup: {e}"
        ))),
    }
}

async fn new_link(handle: &Handle, message: LinkMessage) -> BockerResult<()> {
    link_request(
        handle,
        RouteNetlinkMessage::NewLink(message),
        NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
    )
    .await
}

async fn set_link(handle: &Handle, message: LinkMessage) -> BockerResult<()> {
    link_request(
        handle,
        RouteNetlinkMessage::SetLink(message),
        NLM_F_REQUEST | NLM_F_ACK,
    )
    .await
}

/// Send one rtnetlink request and drain the acked response stream.
async fn link_request(
    handle: &Handle,
    payload: RouteNetlinkMessage,
    flags: u16,
) -> BockerResult<()> {
    use futures::StreamExt;

    let mut req = NetlinkMessage::from(payload);
    req.header.flags = flags;

    let mut response = handle
        .clone()
        .request(req)
        .map_err(|e| BockerError::NetworkSetup(format!("netlink request: {e}")))?;
    while let Some(message) = response.next().await {
        if let NetlinkPayload::Error(err) = message.payload {
            // An ack carries no error code; anything else is a failure.
            if err.code.is_some() {
                return Err(BockerError::NetworkSetup(format!("netlink error: {err:?}")));
            }
        }
    }
    Ok(())
}

fn veth_create_message(host: &str, peer: &str) -> LinkMessage {
    let mut peer_msg = LinkMessage::default();
    peer_msg
        .attributes
        .push(LinkAttribute::IfName(peer.to_string()));

    let mut msg = LinkMessage::default();
    msg.attributes.push(LinkAttribute::IfName(host.to_string()));
    msg.attributes.push(LinkAttribute::LinkInfo(vec![
        LinkInfo::Kind(InfoKind::Veth),
        LinkInfo::Data(InfoData::Veth(InfoVeth::Peer(peer_msg))),
    ]));
    msg
}

fn link_set_controller(index: u32, controller: u32) -> LinkMessage {
    let mut msg = LinkMessage::default();
    msg.header.index = index;
    msg.attributes.push(LinkAttribute::Controller(controller));
    msg
}

fn link_set_netns(index: u32, ns_fd: std::os::fd::RawFd) -> LinkMessage {
    let mut msg = LinkMessage::default();
    msg.header.index = index;
    msg.attributes.push(LinkAttribute::NetNsFd(ns_fd));
    msg
}

fn link_set_address(index: u32, mac: [u8; 6]) -> LinkMessage {
    let mut msg = LinkMessage::default();
    msg.header.index = index;
    msg.attributes.push(LinkAttribute::Address(mac.to_vec()));
    msg
}

// ============================================================================
// INTERIOR CONFIGURATION
// ============================================================================

struct InteriorSpec {
    netns_path: PathBuf,
    ifname: String,
    mac: [u8; 6],
    address: Ipv4Addr,
    prefix_len: u8,
    gateway: Ipv4Addr,
}

/// Run the interior configuration on a dedicated OS thread.
///
/// `setns` pins the calling thread into the namespace; a plain thread (not
/// the blocking pool, whose threads are reused) keeps that from leaking into
/// unrelated work. The thread carries its own current-thread runtime for the
/// netlink connection.
async fn configure_interior(spec: InteriorSpec) -> BockerResult<()> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    std::thread::Builder::new()
        .name("bocker-netns".into())
        .spawn(move || {
            let _ = tx.send(interior_thread_main(spec));
        })
        .map_err(|e| BockerError::NetworkSetup(format!("spawn namespace thread: {e}")))?;
    rx.await
        .map_err(|_| BockerError::NetworkSetup("namespace thread terminated unexpectedly".into()))?
}

fn interior_thread_main(spec: InteriorSpec) -> BockerResult<()> {
    let ns = std::fs::File::open(&spec.netns_path).map_err(|e| {
        BockerError::NetworkSetup(format!("open {}: {e}", spec.netns_path.display()))
    })?;
    nix::sched::setns(&ns, CloneFlags::CLONE_NEWNET)
        .map_err(|e| BockerError::NetworkSetup(format!("enter netns: {e}")))?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()
        .map_err(|e| BockerError::NetworkSetup(format!("interior runtime: {e}")))?;

    rt.block_on(async {
        let (conn, handle, _) = rtnetlink::new_connection()
            .map_err(|e| BockerError::NetworkSetup(format!("interior netlink: {e}")))?;
        let conn_task = tokio::spawn(conn);
        let result = configure_links(&handle, &spec).await;
        conn_task.abort();
        result
    })
}

async fn configure_links(handle: &Handle, spec: &InteriorSpec) -> BockerResult<()> {
    let lo = link_index(handle, "lo").await?;
    handle
        .link()
        .set(LinkUnspec::new_with_index(lo).up().build())
        .execute()
        .await
        .map_err(|e| BockerError::NetworkSetup(format!("bring up lo: {e}")))?;

    let index = link_index(handle, &spec.ifname).await?;

    // MAC changes want the link down; it has not been brought up yet.
    set_link(handle, link_set_address(index, spec.mac)).await?;

    handle
        .address()
        .add(index, IpAddr::V4(spec.address), spec.prefix_len)
        .execute()
        .await
        .map_err(|e| BockerError::NetworkSetup(format!("address {}: {e}", spec.address)))?;

    handle
        .link()
        .set(LinkUnspec::new_with_index(index).up().build())
        .execute()
        .await
        .map_err(|e| BockerError::NetworkSetup(format!("bring up {}: {e}", spec.ifname)))?;

    let route = rtnetlink::RouteMessageBuilder::<Ipv4Addr>::new()
        .gateway(spec.gateway)
        .build();
    handle
        .route()
        .add(route)
        .execute()
        .await
        .map_err(|e| BockerError::NetworkSetup(format!("default route via {}: {e}", spec.gateway)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artefact_names() {
        assert_eq!(host_ifname("ps_42123"), "veth0_ps_42123");
        assert_eq!(peer_ifname("ps_42123"), "veth1_ps_42123");
        assert_eq!(netns_name("ps_42123"), "netns_ps_42123");
        // Interface names must fit IFNAMSIZ (15 chars + NUL).
        assert!(host_ifname("ps_42254").len() <= 15);
        assert!(peer_ifname("ps_42254").len() <= 15);
    }

    #[test]
    fn test_address_suffix_is_bijective_and_avoids_reserved() {
        let mut seen = std::collections::HashSet::new();
        for n in id::ID_MIN..=id::ID_MAX {
            let suffix = address_suffix(&format!("ps_{n}")).unwrap();
            assert!(suffix >= 2, "suffix {suffix} collides with gateway or network");
            assert!(seen.insert(suffix), "suffix {suffix} assigned twice");
        }
    }

    #[test]
    fn test_address_and_mac_derivation() {
        assert_eq!(
            container_address("ps_42002").unwrap(),
            Ipv4Addr::new(10, 0, 0, 2)
        );
        assert_eq!(
            container_address("ps_42254").unwrap(),
            Ipv4Addr::new(10, 0, 0, 254)
        );
        assert_eq!(
            container_mac("ps_42100").unwrap(),
            [0x02, 0x42, 0xac, 0x11, 0x00, 100]
        );
    }

    #[test]
    fn test_address_suffix_rejects_foreign_ids() {
        assert!(address_suffix("ps_99999").is_err());
        assert!(address_suffix("weird").is_err());
    }
}
