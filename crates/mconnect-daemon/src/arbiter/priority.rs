use mconnect_protocol::{ClientType, Priority};

use crate::arbiter::ArbiterClient;

/// Total-order key over registered clients: priority rank first, then PC
/// over mobile, then ascending join time.
pub(crate) fn order_key(client: &ArbiterClient) -> (u8, u8, u64) {
    let type_pref = match client.client_type {
        ClientType::Pc => 0,
        ClientType::Mobile => 1,
    };
    (client.priority.rank(), type_pref, client.joined_at_ms)
}

/// The client that currently owns input, per the ordering above.
///
/// Observers stay registered for broadcast but never own input.
pub(crate) fn active_owner<'a, I>(clients: I) -> Option<&'a ArbiterClient>
where
    I: Iterator<Item = &'a ArbiterClient>,
{
    clients
        .filter(|c| c.priority != Priority::Observer)
        .min_by_key(|c| order_key(c))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(id: &str, client_type: ClientType, priority: Priority, joined: u64) -> ArbiterClient {
        ArbiterClient::new(id.to_string(), client_type, priority, joined)
    }

    #[test]
    fn test_priority_rank_wins() {
        let clients = vec![
            client("mobile-excl", ClientType::Mobile, Priority::Exclusive, 10),
            client("pc-high", ClientType::Pc, Priority::High, 0),
        ];
        assert_eq!(active_owner(clients.iter()).unwrap().id, "mobile-excl");
    }

    #[test]
    fn test_pc_beats_mobile_at_equal_priority() {
        let clients = vec![
            client("mobile", ClientType::Mobile, Priority::High, 0),
            client("pc", ClientType::Pc, Priority::High, 10),
        ];
        assert_eq!(active_owner(clients.iter()).unwrap().id, "pc");
    }

    #[test]
    fn test_join_time_breaks_ties() {
        let clients = vec![
            client("late", ClientType::Mobile, Priority::Normal, 20),
            client("early", ClientType::Mobile, Priority::Normal, 10),
        ];
        assert_eq!(active_owner(clients.iter()).unwrap().id, "early");
    }

    #[test]
    fn test_observers_excluded() {
        let clients = vec![client("observer", ClientType::Pc, Priority::Observer, 0)];
        assert!(active_owner(clients.iter()).is_none());
    }
}
