/// Which side of a pair yields when both offer at once. Fixed for the
/// lifetime of a connection and always opposite on the two ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Polite,
    Impolite,
}

impl Role {
    pub fn from_polite(polite: bool) -> Self {
        if polite {
            Role::Polite
        } else {
            Role::Impolite
        }
    }

    pub fn is_polite(self) -> bool {
        matches!(self, Role::Polite)
    }
}

/// Negotiation phase of one connection.
///
/// `offering` inside the colliding phases records that a local offer is
/// still in flight while the collision is being handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    /// A local offer is being created, committed or sent.
    Offering,
    /// Polite side rolling back its offer to accept the remote one.
    CollidingYield { offering: bool },
    /// Impolite side ignoring a colliding remote offer.
    CollidingWin { offering: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    OfferStarted,
    OfferSettled,
    RemoteDescription { is_offer: bool, stable: bool },
    /// The rollback-and-apply of a yielded collision finished.
    YieldSettled,
}

/// What to do with an arriving remote description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Continue,
    Apply,
    RollbackAndApply,
    Ignore,
}

impl Phase {
    pub fn making_offer(self) -> bool {
        match self {
            Phase::Idle => false,
            Phase::Offering => true,
            Phase::CollidingYield { offering } | Phase::CollidingWin { offering } => offering,
        }
    }

    /// Set while a colliding remote offer is being ignored; failures to add
    /// the remote candidates that belong to it are expected then.
    pub fn ignore_offer(self) -> bool {
        matches!(self, Phase::CollidingWin { .. })
    }

    pub fn transition(self, role: Role, event: PhaseEvent) -> (Phase, Directive) {
        match event {
            PhaseEvent::OfferStarted => (self.with_offering(true), Directive::Continue),
            PhaseEvent::OfferSettled => (self.with_offering(false), Directive::Continue),
            PhaseEvent::RemoteDescription { is_offer, stable } => {
                let offering = self.making_offer();
                let collision = is_offer && (offering || !stable);
                match (collision, role) {
                    (true, Role::Impolite) => {
                        (Phase::CollidingWin { offering }, Directive::Ignore)
                    }
                    (true, Role::Polite) => (
                        Phase::CollidingYield { offering },
                        Directive::RollbackAndApply,
                    ),
                    (false, _) => (Phase::settled(offering), Directive::Apply),
                }
            }
            PhaseEvent::YieldSettled => match self {
                Phase::CollidingYield { offering } => (Phase::settled(offering), Directive::Continue),
                other => (other, Directive::Continue),
            },
        }
    }

    fn settled(offering: bool) -> Phase {
        if offering {
            Phase::Offering
        } else {
            Phase::Idle
        }
    }

    fn with_offering(self, offering: bool) -> Phase {
        match self {
            Phase::Idle | Phase::Offering => Phase::settled(offering),
            Phase::CollidingYield { .. } => Phase::CollidingYield { offering },
            Phase::CollidingWin { .. } => Phase::CollidingWin { offering },
        }
    }
}
