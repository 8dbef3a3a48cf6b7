//! EVM bridge contract ABI definitions.
//!
//! Uses alloy's sol! macro to generate type-safe bindings.

use alloy::sol;

sol! {
    /// Custodial bridge contract on the EVM chain.
    #[sol(rpc)]
    contract CantonBridge {
        /// Tokens locked for bridging; `recipientFingerprint` routes the
        /// mint to a registered ledger user.
        event Deposited(
            bytes32 indexed recipientFingerprint,
            address indexed token,
            address depositor,
            uint256 amount
        );

        /// A ledger-side burn paid out on the EVM chain.
        event WithdrawalCompleted(bytes32 indexed sourceBurnId, address indexed to, uint256 amount);

        /// Pay out a ledger burn. `sourceBurnId` is the idempotency key:
        /// the contract rejects a second completion of the same burn.
        function completeWithdrawal(address to, uint256 amount, bytes32 sourceBurnId) external;

        /// Whether a burn has already been completed.
        function isWithdrawalCompleted(bytes32 sourceBurnId) external view returns (bool);
    }
}
